//! Requests that drive an upgrader from the outside: deploying a modified
//! origin (upgrade, rebase, package and override changes), toggling
//! initramfs regeneration, rolling back, previewing an update's packages
//! and cleaning up.
//!
//! Dispatch, locking and progress transport belong to the caller; these
//! functions only translate a request into upgrader and origin operations.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::context::CORE_CACHEDIR;
use crate::error::UpgradeError;
use crate::origin::Origin;
use crate::pkgcache::import_local_package;
use crate::progress::ProgressSink;
use crate::rpmutils::RPMDB_LOCATION;
use crate::store::{Deployment, PullFlags, Repo};
use crate::syscore;
use crate::sysroot_upgrade::{Backends, SysrootUpgrader, UpgraderFlags, UpgraderOpts};
use crate::utils::{
    format_refspec, is_checksum, parse_refspec, shorten_checksum, validate_checksum_string,
    Cancellable,
};
use anyhow::{anyhow, bail, Result};
use bitflags::bitflags;
use camino::Utf8Path;
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde_derive::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeployFlags: u32 {
        const REBOOT = 1 << 0;
        const ALLOW_DOWNGRADE = 1 << 1;
        const SKIP_PURGE = 1 << 2;
        const NO_PULL_BASE = 1 << 3;
        const DRY_RUN = 1 << 4;
        const NO_OVERRIDES = 1 << 5;
        const NOSCRIPTS = 1 << 6;
    }
}

/// The options bag of a deploy request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeployOptions {
    pub reboot_after: bool,
    pub allow_downgrade: bool,
    pub skip_purge: bool,
    pub no_pull_base: bool,
    pub dry_run: bool,
    pub reset_all: bool,
    pub no_scripts: bool,
}

impl DeployOptions {
    pub fn flags(&self) -> DeployFlags {
        let mut r = DeployFlags::empty();
        for (set, flag) in [
            (self.reboot_after, DeployFlags::REBOOT),
            (self.allow_downgrade, DeployFlags::ALLOW_DOWNGRADE),
            (self.skip_purge, DeployFlags::SKIP_PURGE),
            (self.no_pull_base, DeployFlags::NO_PULL_BASE),
            (self.dry_run, DeployFlags::DRY_RUN),
            (self.reset_all, DeployFlags::NO_OVERRIDES),
            (self.no_scripts, DeployFlags::NOSCRIPTS),
        ] {
            r.set(flag, set);
        }
        r
    }
}

/// A request to deploy a modified origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeployRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osname: Option<String>,
    /// Rebase to this (possibly partial) refspec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refspec: Option<String>,
    /// Pin to this checksum or version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uninstall_packages: Vec<String>,
    /// Paths to package files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_local_packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub override_remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub override_replace: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub override_reset: Vec<String>,
    #[serde(default)]
    pub options: DeployOptions,
}

impl DeployRequest {
    /// Reject requests no deployment can satisfy.
    pub fn validate(&self) -> Result<()> {
        if !self.override_replace.is_empty() {
            bail!("Non-local replacement overrides not implemented yet");
        }
        if self.options.reset_all
            && !(self.override_remove.is_empty() && self.override_reset.is_empty())
        {
            bail!("Cannot combine resetting all overrides with individual overrides");
        }
        Ok(())
    }
}

/// A request to fetch just the package database of the next base, so
/// its packages can be compared before deploying.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageDiffRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refspec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CleanupFlags: u32 {
        const BASE = 1 << 0;
        const PENDING_DEPLOY = 1 << 1;
        const ROLLBACK_DEPLOY = 1 << 2;
        const REPOMD = 1 << 3;
    }
}

/// A request to drop deployments and cached data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CleanupRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osname: Option<String>,
    pub base: bool,
    pub pending_deploy: bool,
    pub rollback_deploy: bool,
    pub repomd: bool,
}

impl CleanupRequest {
    pub fn flags(&self) -> CleanupFlags {
        let mut r = CleanupFlags::empty();
        r.set(CleanupFlags::BASE, self.base);
        r.set(CleanupFlags::PENDING_DEPLOY, self.pending_deploy);
        r.set(CleanupFlags::ROLLBACK_DEPLOY, self.rollback_deploy);
        r.set(CleanupFlags::REPOMD, self.repomd);
        r
    }
}

/// A request to make the rollback deployment the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RollbackRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osname: Option<String>,
    pub reboot: bool,
}

/// A request to enable or disable initramfs regeneration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InitramfsStateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osname: Option<String>,
    pub regenerate: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default)]
    pub reboot: bool,
}

/// Any request the front end can emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transaction", rename_all = "kebab-case")]
pub enum TransactionRequest {
    Deploy(DeployRequest),
    InitramfsState(InitramfsStateRequest),
    Rollback(RollbackRequest),
    PackageDiff(PackageDiffRequest),
    Cleanup(CleanupRequest),
}

/// What a transaction did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOutcome {
    pub title: String,
    pub changed: bool,
    /// The new deployment; `None` if nothing was deployed or for a dry run.
    pub deployment: Option<Deployment>,
    /// The caller should reboot into the new deployment.
    pub reboot: bool,
    pub messages: Vec<String>,
}

impl TransactionOutcome {
    fn message(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::info!("{msg}");
        self.messages.push(msg);
    }
}

/// A parsed `revision` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    Checksum(String),
    Version(String),
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.get(..prefix.len())
        .filter(|p| p.eq_ignore_ascii_case(prefix))
        .map(|_| &s[prefix.len()..])
}

/// Parse `revision=CHECKSUM`, `version=VERSION`, or a bare checksum or
/// version.
pub fn parse_revision(revision: &str) -> Result<Revision> {
    let s = revision.trim();
    if let Some(c) = strip_prefix_ignore_case(s, "revision=") {
        validate_checksum_string(c)?;
        return Ok(Revision::Checksum(c.to_string()));
    }
    if let Some(v) = strip_prefix_ignore_case(s, "version=") {
        return Ok(Revision::Version(v.to_string()));
    }
    if s.is_empty() {
        bail!("Invalid empty revision");
    }
    if is_checksum(s) {
        Ok(Revision::Checksum(s.to_string()))
    } else {
        Ok(Revision::Version(s.to_string()))
    }
}

/// Complete a refspec given on the command line against the current one:
/// `remote:` switches only the remote, `:branch` names a local branch, and
/// a bare branch keeps the current remote.
pub fn refspec_parse_partial(new: &str, base: Option<&str>) -> Result<String> {
    let mut infer_remote = true;
    let (mut remote, mut branch) = if let Some(r) = new.strip_suffix(':') {
        (Some(r.to_string()), None)
    } else if let Some(b) = new.strip_prefix(':') {
        infer_remote = false;
        (None, Some(b.to_string()))
    } else {
        let (r, b) = parse_refspec(new)?;
        (r, Some(b))
    };
    let (origin_remote, origin_branch) = match base {
        Some(base) => {
            let (r, b) = parse_refspec(base)?;
            (r, Some(b))
        }
        None => (None, None),
    };
    if branch.is_none() {
        branch = Some(
            origin_branch
                .clone()
                .ok_or_else(|| anyhow!("Could not determine default ref to pull"))?,
        );
    } else if infer_remote && remote.is_none() {
        remote = origin_remote.clone();
    }
    let branch = branch.unwrap_or_default();
    if remote == origin_remote && Some(&branch) == origin_branch.as_ref() {
        bail!(
            "Old and new refs are equal: {}",
            format_refspec(remote.as_deref(), &branch)
        );
    }
    Ok(format_refspec(remote.as_deref(), &branch))
}

/// Rebase `origin`; returns the previous refspec.
fn change_origin_refspec(
    origin: &mut Origin,
    refspec: &str,
    outcome: &mut TransactionOutcome,
) -> Result<String> {
    let current = origin.refspec().to_string();
    let new = refspec_parse_partial(refspec, Some(&current))?;
    if current == new {
        bail!("Old and new refs are equal: {new}");
    }
    origin.set_rebase(&new)?;
    let (cur_remote, cur_branch) = parse_refspec(&current)?;
    let (new_remote, new_branch) = parse_refspec(&new)?;
    if new_remote != cur_remote && new_branch == cur_branch {
        if let Some(r) = new_remote {
            outcome.message(format!("Rebasing to {r}:{cur_branch}"));
        }
    }
    Ok(current)
}

/// Find the commit on `refspec`'s history with the given version.
#[context("Looking up version {}", version)]
pub fn lookup_version(
    repo: &dyn Repo,
    refspec: &str,
    version: &str,
    progress: Option<&dyn ProgressSink>,
    cancellable: &Cancellable,
) -> Result<String> {
    let (remote, branch) = parse_refspec(refspec)?;
    if let Some(remote) = remote.as_deref() {
        repo.pull(remote, None, &[&branch], PullFlags::COMMIT_ONLY, progress, cancellable)?;
    }
    let mut cur = repo
        .resolve_rev(refspec, false)?
        .ok_or_else(|| anyhow!("Refspec '{refspec}' not found"))?;
    loop {
        cancellable.set_error_if_cancelled()?;
        let info = repo.load_commit(&cur)?;
        if info.version() == Some(version) {
            return Ok(cur);
        }
        match info.parent {
            Some(p) if repo.has_commit(&p)? => cur = p,
            _ => break,
        }
    }
    bail!("Version {version} not found in {refspec}")
}

/// Make sure `checksum` is available, fetching it from `refspec`'s remote.
pub fn lookup_checksum(
    repo: &dyn Repo,
    refspec: &str,
    checksum: &str,
    progress: Option<&dyn ProgressSink>,
    cancellable: &Cancellable,
) -> Result<()> {
    let (remote, _) = parse_refspec(refspec)?;
    if let Some(remote) = remote.as_deref() {
        repo.pull(remote, None, &[checksum], PullFlags::COMMIT_ONLY, progress, cancellable)?;
    }
    if !repo.has_commit(checksum)? {
        bail!("Checksum {checksum} not found in {refspec}");
    }
    Ok(())
}

fn apply_revision_override(
    repo: &dyn Repo,
    origin: &mut Origin,
    revision: &str,
    progress: Option<&dyn ProgressSink>,
    cancellable: &Cancellable,
    outcome: &mut TransactionOutcome,
) -> Result<()> {
    match parse_revision(revision)? {
        Revision::Version(v) => {
            outcome.message(format!("Resolving version '{v}'"));
            let c = lookup_version(repo, origin.refspec(), &v, progress, cancellable)?;
            origin.set_override_commit(Some((&c, Some(&v))));
        }
        Revision::Checksum(c) => {
            outcome.message(format!("Validating checksum '{c}'"));
            lookup_checksum(repo, origin.refspec(), &c, progress, cancellable)?;
            origin.set_override_commit(Some((&c, None)));
        }
    }
    Ok(())
}

/// Apply a [`DeployRequest`] and deploy the result if anything changed.
#[context("Executing deploy transaction")]
pub fn deploy_transaction_execute(
    backends: Backends<'_>,
    req: &DeployRequest,
    progress: Option<&dyn ProgressSink>,
    cancellable: &Cancellable,
) -> Result<TransactionOutcome> {
    req.validate()?;
    let flags = req.options.flags();
    let no_overrides = flags.contains(DeployFlags::NO_OVERRIDES);
    let mut upgrader_flags = UpgraderFlags::empty();
    upgrader_flags.set(
        UpgraderFlags::ALLOW_OLDER,
        flags.contains(DeployFlags::ALLOW_DOWNGRADE),
    );
    upgrader_flags.set(UpgraderFlags::DRY_RUN, flags.contains(DeployFlags::DRY_RUN));
    upgrader_flags.set(
        UpgraderFlags::PKGOVERLAY_NOSCRIPTS,
        flags.contains(DeployFlags::NOSCRIPTS),
    );
    // Rebasing away from an unconfigured tree is how one configures it
    upgrader_flags.set(UpgraderFlags::IGNORE_UNCONFIGURED, req.refspec.is_some());

    let mut upgrader = SysrootUpgrader::new(UpgraderOpts {
        backends,
        osname: req.osname.clone(),
        flags: upgrader_flags,
    })?;
    let repo = backends.sysroot.repo();
    let mut outcome = TransactionOutcome::default();
    let mut origin = upgrader.dup_origin();

    let old_refspec = match req.refspec.as_deref() {
        Some(r) => Some(change_origin_refspec(&mut origin, r, &mut outcome)?),
        None => None,
    };

    match req.revision.as_deref() {
        Some(rev) => {
            apply_revision_override(repo, &mut origin, rev, progress, cancellable, &mut outcome)?
        }
        None => origin.set_override_commit(None),
    }

    let (is_install, is_override) = if flags.contains(DeployFlags::NO_PULL_BASE) {
        let is_override =
            !req.override_reset.is_empty() || !req.override_remove.is_empty() || no_overrides;
        (!is_override, is_override)
    } else {
        (false, false)
    };
    let mut title = if is_install {
        "install"
    } else if is_override {
        "override"
    } else if req.refspec.is_some() {
        "rebase"
    } else if req.revision.is_some() {
        "deploy"
    } else {
        "upgrade"
    }
    .to_string();

    let mut changed = false;
    if !req.uninstall_packages.is_empty() {
        origin.remove_packages(&req.uninstall_packages)?;
        // The origin changed even if no layer ends up being needed
        changed = true;
    }
    if !req.install_packages.is_empty() {
        origin.add_packages(&req.install_packages, false)?;
        changed = true;
    }
    if !req.install_local_packages.is_empty() {
        let pkgs = req
            .install_local_packages
            .iter()
            .map(|p| {
                import_local_package(
                    backends.sysroot.pkgcache(),
                    backends.backend,
                    Utf8Path::new(p),
                    cancellable,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        origin.add_packages(&pkgs, true)?;
        changed = true;
    }
    if no_overrides {
        changed |= origin.remove_all_overrides();
    } else if !req.override_reset.is_empty() {
        origin.remove_overrides(&req.override_reset)?;
        changed = true;
    }
    if !(req.uninstall_packages.is_empty()
        && req.install_packages.is_empty()
        && req.install_local_packages.is_empty())
    {
        title.push_str(&format!(
            "; remove: {} install: {}; localinstall: {}",
            req.uninstall_packages.len(),
            req.install_packages.len(),
            req.install_local_packages.len()
        ));
    }
    outcome.title = title;
    upgrader.set_origin(origin);

    if !flags.contains(DeployFlags::NO_PULL_BASE) {
        changed |= upgrader.pull(None, PullFlags::empty(), progress, cancellable)?;
    }

    // Canonicalize removals against the (possibly new) base
    if !req.override_remove.is_empty() {
        let base = upgrader.base().to_string();
        let sack = syscore::package_sack_for_commit(repo, backends.backend, &base, cancellable)?;
        let mut names = Vec::new();
        for p in &req.override_remove {
            let matches: Vec<_> = sack.matching(p).collect();
            match matches.as_slice() {
                [] => bail!(
                    "No package \"{p}\" in base commit {}",
                    shorten_checksum(&base)
                ),
                [one] => names.push(one.pkg.name.clone()),
                _ => bail!("Multiple packages match \"{p}\""),
            }
        }
        let mut origin = upgrader.dup_origin();
        origin.add_override_remove(&names)?;
        upgrader.set_origin(origin);
        changed = true;
    }

    outcome.changed = changed;
    if changed || req.refspec.is_some() {
        outcome.deployment = upgrader.deploy(cancellable)?;
        let dry_run = flags.contains(DeployFlags::DRY_RUN);
        if let Some(old) = old_refspec.filter(|_| !dry_run) {
            if !flags.contains(DeployFlags::SKIP_PURGE) {
                // The rebase itself succeeded; the old ref may not even exist
                if let Ok((remote, r)) = parse_refspec(&old) {
                    if let Err(e) = repo.set_ref_immediate(remote.as_deref(), &r, None) {
                        tracing::debug!("purging {old}: {e}");
                    }
                }
            }
        }
        outcome.reboot = flags.contains(DeployFlags::REBOOT) && outcome.deployment.is_some();
    } else if req.revision.is_none() {
        outcome.message("No upgrade available.");
    } else {
        outcome.message("No change.");
    }
    Ok(outcome)
}

/// Enable or disable initramfs regeneration and deploy.
#[context("Executing initramfs-state transaction")]
pub fn initramfs_state_execute(
    backends: Backends<'_>,
    req: &InitramfsStateRequest,
    cancellable: &Cancellable,
) -> Result<TransactionOutcome> {
    let mut upgrader = SysrootUpgrader::new(UpgraderOpts {
        backends,
        osname: req.osname.clone(),
        flags: UpgraderFlags::empty(),
    })?;
    let mut origin = upgrader.dup_origin();
    let current = origin.regenerate_initramfs();
    // Arguments are not compared; passing any means "regenerate again"
    if current == req.regenerate && origin.initramfs_args().is_empty() && req.args.is_empty() {
        bail!(
            "initramfs regeneration state is already {}",
            if current { "enabled" } else { "disabled" }
        );
    }
    origin.set_regenerate_initramfs(req.regenerate, &req.args);
    upgrader.set_origin(origin);
    let deployment = upgrader.deploy(cancellable)?;
    Ok(TransactionOutcome {
        title: "initramfs".to_string(),
        changed: true,
        reboot: req.reboot && deployment.is_some(),
        deployment,
        messages: Vec::new(),
    })
}

/// Make the rollback deployment the default.
#[context("Executing rollback transaction")]
pub fn rollback_execute(
    backends: Backends<'_>,
    osname: Option<&str>,
    reboot: bool,
    cancellable: &Cancellable,
) -> Result<TransactionOutcome> {
    let sysroot = backends.sysroot;
    let osname = match osname {
        Some(o) => o.to_string(),
        None => sysroot.booted_deployment().map(|d| d.osname).ok_or_else(|| {
            UpgradeError::config("Not currently booted into an OSTree system and no OS specified")
        })?,
    };
    let (_, rollback) = syscore::query_deployments_for(sysroot, &osname);
    let rollback = rollback.ok_or_else(|| anyhow!("No rollback deployment found"))?;
    let mut outcome = TransactionOutcome {
        title: "rollback".to_string(),
        ..Default::default()
    };
    outcome.message(format!(
        "Moving '{}.{}' to be first deployment",
        rollback.csum, rollback.deployserial
    ));
    let old = sysroot.deployments();
    let mut new = vec![rollback.clone()];
    new.extend(old.iter().filter(|d| !d.equal(&rollback)).cloned());
    let changed = old.first().map(|d| !d.equal(&rollback)).unwrap_or(true);
    if changed {
        syscore::write_deployments(sysroot, &new, cancellable)?;
    }
    outcome.changed = changed;
    outcome.reboot = reboot && changed;
    outcome.deployment = Some(rollback);
    Ok(outcome)
}

/// Pull only the package database of the new base named by the origin,
/// as modified by a rebase or revision.  Nothing is deployed.
#[context("Executing package-diff transaction")]
pub fn package_diff_execute(
    backends: Backends<'_>,
    req: &PackageDiffRequest,
    progress: Option<&dyn ProgressSink>,
    cancellable: &Cancellable,
) -> Result<TransactionOutcome> {
    let mut flags = UpgraderFlags::empty();
    // Comparing against an older tree is fine when it was asked for
    flags.set(
        UpgraderFlags::ALLOW_OLDER,
        req.revision.is_some() || req.refspec.is_some(),
    );
    let mut upgrader = SysrootUpgrader::new(UpgraderOpts {
        backends,
        osname: req.osname.clone(),
        flags,
    })?;
    let repo = backends.sysroot.repo();
    let mut outcome = TransactionOutcome {
        title: "package-diff".to_string(),
        ..Default::default()
    };
    let mut origin = upgrader.dup_origin();
    let upgrading = req.refspec.is_none() && req.revision.is_none();
    if let Some(r) = req.refspec.as_deref() {
        change_origin_refspec(&mut origin, r, &mut outcome)?;
    }
    match req.revision.as_deref() {
        Some(rev) => {
            apply_revision_override(repo, &mut origin, rev, progress, cancellable, &mut outcome)?
        }
        None if upgrading => origin.set_override_commit(None),
        None => {}
    }
    outcome.message(format!("Updating from: {}", origin.refspec()));
    upgrader.set_origin(origin);

    let rpmdb = format!("/{RPMDB_LOCATION}");
    outcome.changed = upgrader.pull(Some(&rpmdb), PullFlags::empty(), progress, cancellable)?;
    if !outcome.changed {
        outcome.message(if upgrading {
            "No upgrade available."
        } else {
            "No change."
        });
    }
    Ok(outcome)
}

/// Empty the directory at `path` under `root`, if it exists.
fn remove_directory_contents(root: &Dir, path: &str) -> Result<()> {
    let Some(d) = root.open_dir_optional(path)? else {
        return Ok(());
    };
    for ent in d.entries()? {
        let ent = ent?;
        let name = ent.file_name();
        if ent.file_type()?.is_dir() {
            d.remove_dir_all(&name)?;
        } else {
            d.remove_file(&name)?;
        }
    }
    Ok(())
}

/// Drop pending and/or rollback deployments, stale base refs and
/// unreferenced local packages, and cached repository metadata.
#[context("Executing cleanup transaction")]
pub fn cleanup_execute(
    backends: Backends<'_>,
    req: &CleanupRequest,
    cancellable: &Cancellable,
) -> Result<TransactionOutcome> {
    let sysroot = backends.sysroot;
    let mut flags = req.flags();
    let mut outcome = TransactionOutcome {
        title: "cleanup".to_string(),
        ..Default::default()
    };
    let pending = flags.contains(CleanupFlags::PENDING_DEPLOY);
    let rollback = flags.contains(CleanupFlags::ROLLBACK_DEPLOY);
    if pending || rollback {
        let osname = match req.osname.as_deref() {
            Some(o) => o.to_string(),
            None => sysroot.booted_deployment().map(|d| d.osname).ok_or_else(|| {
                UpgradeError::config("Not currently booted into an OSTree system and no OS specified")
            })?,
        };
        match syscore::filter_deployments(sysroot, &osname, pending, rollback) {
            Some(new) => {
                sysroot.write_deployments(&new, cancellable)?;
                outcome.changed = true;
                // Their base commits may no longer need protecting
                flags |= CleanupFlags::BASE;
            }
            None => outcome.message("Deployments unchanged."),
        }
    }
    if flags.contains(CleanupFlags::BASE) {
        syscore::cleanup(sysroot, cancellable)?;
    }
    if flags.contains(CleanupFlags::REPOMD) {
        remove_directory_contents(&sysroot.open_dir()?, CORE_CACHEDIR)?;
    }
    Ok(outcome)
}

/// Execute any front end request.
pub fn execute(
    backends: Backends<'_>,
    req: &TransactionRequest,
    progress: Option<&dyn ProgressSink>,
    cancellable: &Cancellable,
) -> Result<TransactionOutcome> {
    match req {
        TransactionRequest::Deploy(r) => deploy_transaction_execute(backends, r, progress, cancellable),
        TransactionRequest::InitramfsState(r) => initramfs_state_execute(backends, r, cancellable),
        TransactionRequest::Rollback(r) => {
            rollback_execute(backends, r.osname.as_deref(), r.reboot, cancellable)
        }
        TransactionRequest::PackageDiff(r) => {
            package_diff_execute(backends, r, progress, cancellable)
        }
        TransactionRequest::Cleanup(r) => cleanup_execute(backends, r, cancellable),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const C1: &str = "126539c731acf376359aced177dc5dff598dd6714a0a8faf753c727559adc8b5";

    #[test]
    fn revisions() -> Result<()> {
        assert_eq!(
            parse_revision(&format!("revision={C1}"))?,
            Revision::Checksum(C1.into())
        );
        assert_eq!(
            parse_revision(&format!("REVISION={C1}"))?,
            Revision::Checksum(C1.into())
        );
        assert!(parse_revision("revision=abc").is_err());
        assert_eq!(
            parse_revision("version=35.20211001.0")?,
            Revision::Version("35.20211001.0".into())
        );
        assert_eq!(parse_revision(C1)?, Revision::Checksum(C1.into()));
        assert_eq!(
            parse_revision(" 35.1 ")?,
            Revision::Version("35.1".into())
        );
        assert!(parse_revision("").is_err());
        Ok(())
    }

    #[test]
    fn partial_refspecs() -> Result<()> {
        let base = Some("fedora:fedora/x86_64/coreos/stable");
        let cases = [
            ("fedora/x86_64/coreos/next", "fedora:fedora/x86_64/coreos/next"),
            ("updates:", "updates:fedora/x86_64/coreos/stable"),
            (":local/branch", "local/branch"),
            ("other:some/branch", "other:some/branch"),
        ];
        for (new, expected) in cases {
            assert_eq!(refspec_parse_partial(new, base)?, expected, "{new}");
        }
        let e = refspec_parse_partial("fedora:", base).unwrap_err();
        assert_eq!(
            e.to_string(),
            "Old and new refs are equal: fedora:fedora/x86_64/coreos/stable"
        );
        assert!(refspec_parse_partial("fedora/x86_64/coreos/stable", base).is_err());
        assert!(refspec_parse_partial("updates:", None).is_err());
        Ok(())
    }

    #[test]
    fn options() {
        let o: DeployOptions =
            serde_json::from_str(r#"{"reboot-after": true, "reset-all": true}"#).unwrap();
        assert_eq!(o.flags(), DeployFlags::REBOOT | DeployFlags::NO_OVERRIDES);
        let req = DeployRequest {
            override_replace: vec!["foo".into()],
            ..Default::default()
        };
        assert!(req.validate().is_err());
        let req = DeployRequest {
            override_remove: vec!["foo".into()],
            options: o,
            ..Default::default()
        };
        assert!(req.validate().is_err());
    }
}
