//! Queries and policy over the deployment list: which deployment to
//! merge from, how a new deployment is inserted, and how the base commits
//! of layered deployments are kept alive.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::context::PackageBackend;
use crate::error::UpgradeError;
use crate::origin::Origin;
use crate::rpmutils::{nevra_to_cache_branch, PackageSack, PKGCACHE_BRANCH_PREFIX, RPMDB_LOCATION};
use crate::store::{
    Deployment, Repo, Sysroot, BASE_REF_PREFIX, CLIENTLAYER_KEY, CLIENTLAYER_VERSION_KEY,
    PACKAGES_KEY, REMOVED_BASE_PACKAGES_KEY,
};
use crate::utils::Cancellable;
use anyhow::{anyhow, Result};
use cap_std::fs::Dir;
use fn_error_context::context;
use std::collections::BTreeSet;

/// Layering state of a deployment's commit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LayeredInfo {
    pub is_layered: bool,
    /// For a layered commit, the unlayered base it was built from.
    pub base_commit: Option<String>,
    pub clientlayer_version: u64,
    pub layered_pkgs: Vec<String>,
    pub removed_base_pkgs: Vec<String>,
}

fn metadata_strv(info: &crate::store::CommitInfo, key: &str) -> Vec<String> {
    info.metadata
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[context("Reading layered info for {}", commit)]
pub fn commit_get_layered_info(repo: &dyn Repo, commit: &str) -> Result<LayeredInfo> {
    let info = repo.load_commit(commit)?;
    let is_layered = info
        .metadata
        .get(CLIENTLAYER_KEY)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !is_layered {
        return Ok(LayeredInfo::default());
    }
    let base_commit = info
        .parent
        .clone()
        .ok_or_else(|| anyhow!("Layered commit {commit} has no parent"))?;
    Ok(LayeredInfo {
        is_layered,
        base_commit: Some(base_commit),
        clientlayer_version: info
            .metadata
            .get(CLIENTLAYER_VERSION_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        layered_pkgs: metadata_strv(&info, PACKAGES_KEY),
        removed_base_pkgs: metadata_strv(&info, REMOVED_BASE_PACKAGES_KEY),
    })
}

pub fn deployment_get_layered_info(repo: &dyn Repo, d: &Deployment) -> Result<LayeredInfo> {
    commit_get_layered_info(repo, &d.csum)
}

/// The deployment whose `/etc` we merge from: the booted one if it is
/// for `osname`, otherwise the first deployment of `osname`.
pub fn merge_deployment(sysroot: &dyn Sysroot, osname: &str) -> Option<Deployment> {
    if let Some(booted) = sysroot.booted_deployment() {
        if booted.osname == osname {
            return Some(booted);
        }
    }
    sysroot
        .deployments()
        .into_iter()
        .find(|d| d.osname == osname)
}

/// Find the pending and rollback deployments for `osname`, relative to
/// the booted deployment.
pub fn query_deployments_for(
    sysroot: &dyn Sysroot,
    osname: &str,
) -> (Option<Deployment>, Option<Deployment>) {
    let booted = sysroot.booted_deployment();
    let mut pending = None;
    let mut rollback = None;
    let mut found_booted = false;
    for d in sysroot.deployments() {
        if d.osname != osname {
            continue;
        }
        if booted.as_ref().map(|b| b.equal(&d)).unwrap_or(false) {
            found_booted = true;
            continue;
        }
        if !found_booted && pending.is_none() {
            pending = Some(d);
        } else if found_booted && rollback.is_none() {
            rollback = Some(d);
        }
    }
    (pending, rollback)
}

/// The deployment whose origin and base we start from: a pending
/// deployment if there is one, so successive operations stack, and
/// otherwise the merge deployment.
pub fn origin_merge_deployment(sysroot: &dyn Sysroot, osname: &str) -> Option<Deployment> {
    let (pending, _) = query_deployments_for(sysroot, osname);
    pending.or_else(|| merge_deployment(sysroot, osname))
}

/// Compute the new deployment list with `new_deployment` first.  Other
/// deployments of the same OS are kept only if they are booted, the merge
/// deployment, or pinned.
pub fn add_deployment(
    sysroot: &dyn Sysroot,
    new_deployment: &Deployment,
    merge_deployment: Option<&Deployment>,
) -> Vec<Deployment> {
    let booted = sysroot.booted_deployment();
    let osname = new_deployment.osname.as_str();
    let mut r = vec![new_deployment.clone()];
    for d in sysroot.deployments() {
        let is_booted = booted.as_ref().map(|b| b.equal(&d)).unwrap_or(false);
        let is_merge = merge_deployment.map(|m| m.equal(&d)).unwrap_or(false);
        if d.equal(new_deployment) {
            continue;
        }
        if d.osname != osname || is_booted || is_merge || d.pinned {
            r.push(d);
        }
    }
    r
}

/// Recreate the `rpmostree/base/N` refs so the base commit of every
/// layered deployment stays reachable.  This also drops the temporary
/// base ref.
#[context("Generating base layer refs")]
pub fn generate_baselayer_refs(repo: &dyn Repo, deployments: &[Deployment]) -> Result<()> {
    for r in repo.list_refs(BASE_REF_PREFIX)? {
        repo.set_ref_immediate(None, &r, None)?;
    }
    let mut seen = BTreeSet::new();
    for d in deployments {
        let info = deployment_get_layered_info(repo, d)?;
        let Some(base) = info.base_commit else {
            continue;
        };
        if seen.insert(base.clone()) {
            let name = format!("{}{}", BASE_REF_PREFIX, seen.len() - 1);
            repo.set_ref_immediate(None, &name, Some(&base))?;
        }
    }
    Ok(())
}

/// Atomically publish `deployments`, then refresh the base layer refs.
#[context("Writing deployments")]
pub fn write_deployments(
    sysroot: &dyn Sysroot,
    deployments: &[Deployment],
    cancellable: &Cancellable,
) -> Result<()> {
    sysroot.write_deployments(deployments, cancellable)?;
    generate_baselayer_refs(sysroot.repo(), deployments)?;
    Ok(())
}

/// The deployment list without the pending and/or rollback deployments
/// of `osname`, or `None` if that would remove nothing.  The booted
/// deployment and other operating systems are always kept.
pub fn filter_deployments(
    sysroot: &dyn Sysroot,
    osname: &str,
    remove_pending: bool,
    remove_rollback: bool,
) -> Option<Vec<Deployment>> {
    let booted = sysroot.booted_deployment();
    let deployments = sysroot.deployments();
    let mut found_booted = false;
    let mut r = Vec::with_capacity(deployments.len());
    let mut changed = false;
    for d in deployments {
        let is_booted = booted.as_ref().map(|b| b.equal(&d)).unwrap_or(false);
        if is_booted {
            found_booted = true;
        }
        if is_booted || d.osname != osname {
            r.push(d);
            continue;
        }
        if (!found_booted && remove_pending) || (found_booted && remove_rollback) {
            tracing::debug!("Dropping deployment {}", d.id());
            changed = true;
            continue;
        }
        r.push(d);
    }
    changed.then_some(r)
}

/// Drop local package cache branches no deployment requests anymore.
/// Returns how many were removed.
fn clean_pkgcache_orphans(sysroot: &dyn Sysroot) -> Result<usize> {
    let mut referenced = BTreeSet::new();
    for d in sysroot.deployments() {
        let Some(origin) = d.origin.as_deref() else {
            continue;
        };
        let origin = Origin::new_from_str(origin)?;
        for nevra in origin.local_packages().keys() {
            referenced.insert(nevra_to_cache_branch(nevra)?);
        }
    }
    let pkgcache = sysroot.pkgcache();
    let mut n = 0;
    for branch in pkgcache.list_refs(PKGCACHE_BRANCH_PREFIX)? {
        if !referenced.contains(&branch) {
            pkgcache.set_ref_immediate(None, &branch, None)?;
            n += 1;
        }
    }
    Ok(n)
}

/// Reset the base layer refs to exactly what the current deployments
/// need, and drop unreferenced local packages.
#[context("Cleaning up")]
pub fn cleanup(sysroot: &dyn Sysroot, cancellable: &Cancellable) -> Result<()> {
    cancellable.set_error_if_cancelled()?;
    generate_baselayer_refs(sysroot.repo(), &sysroot.deployments())?;
    let n = clean_pkgcache_orphans(sysroot)?;
    if n > 0 {
        tracing::info!("Freed {n} pkgcache branches");
    }
    Ok(())
}

fn format_timestamp(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Refuse to move from `from_rev` to an older `to_rev`.
pub fn check_timestamps(repo: &dyn Repo, from_rev: &str, to_rev: &str) -> Result<()> {
    let from = repo.load_commit(from_rev)?;
    let to = repo.load_commit(to_rev)?;
    if to.timestamp < from.timestamp {
        return Err(UpgradeError::Regression(format!(
            "Upgrade target revision '{}' with timestamp '{}' is chronologically older than current revision '{}' with timestamp '{}'; use --allow-downgrade to permit",
            to_rev,
            format_timestamp(to.timestamp),
            from_rev,
            format_timestamp(from.timestamp)
        ))
        .into());
    }
    Ok(())
}

/// Load the package set of a commit without checking out the whole tree.
#[context("Loading package set for {}", rev)]
pub fn package_sack_for_commit(
    repo: &dyn Repo,
    backend: &dyn PackageBackend,
    rev: &str,
    cancellable: &Cancellable,
) -> Result<PackageSack> {
    let tmpd = tempfile::Builder::new().prefix("rpmostree-sack-").tempdir()?;
    let dest = Dir::open_ambient_dir(tmpd.path(), cap_std::ambient_authority())?;
    repo.checkout(rev, Some(RPMDB_LOCATION), &dest, "root", None, cancellable)?;
    let root = dest.open_dir("root")?;
    Ok(PackageSack::new_from_rpmdb(backend.load_rpmdb(&root)?))
}
