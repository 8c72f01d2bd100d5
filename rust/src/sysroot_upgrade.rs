//! Upgrade one OS in a sysroot: pull a new base, layer the requested
//! packages and overrides on top of it, and publish the result as a new
//! deployment.
//!
//! The flow is [`SysrootUpgrader::new`], optionally
//! [`SysrootUpgrader::pull`], then [`SysrootUpgrader::deploy`].  When the
//! origin asks for anything on top of the base, `deploy` checks the base
//! out into a scratch directory, resolves the package set against it and
//! commits the assembled tree as a "client layer" whose parent is the base.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::context::{ContextConfig, PackageBackend, TransactionSummary};
use crate::error::UpgradeError;
use crate::failpoints;
use crate::initramfs::InitramfsGenerator;
use crate::origin::{Origin, RefspecType};
use crate::pkgcache::find_pkg_header;
use crate::progress::{progress_n_items, progress_task, ProgressSink};
use crate::rpmutils::{PackageSack, PackageSource};
use crate::store::{
    Deployment, DevInoCache, PullFlags, Repo, Sysroot, CLIENTLAYER_KEY, CLIENTLAYER_VERSION_KEY,
    PACKAGES_KEY, REMOVED_BASE_PACKAGES_KEY, SEPOLICY_KEY, SPEC_KEY, TMP_BASE_REF,
    TMP_ROOTFS_DIR, VERSION_KEY,
};
use crate::syscore;
use crate::treespec::Treespec;
use crate::utils::{parse_refspec, shorten_checksum, Cancellable};
use anyhow::{anyhow, Context, Result};
use bitflags::bitflags;
use camino::Utf8PathBuf;
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use maplit::btreemap;
use serde_json::json;

/// Bumped whenever the layout of layered commits changes.
const CLIENTLAYER_VERSION: u64 = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpgraderFlags: u32 {
        /// Proceed even if the origin carries an `unconfigured-state`.
        const IGNORE_UNCONFIGURED = 1 << 0;
        /// Permit moving to a base with an older timestamp.
        const ALLOW_OLDER = 1 << 1;
        /// Resolve and print the transaction, but write nothing.
        const DRY_RUN = 1 << 2;
        /// Do not run package scripts during assembly.
        const PKGOVERLAY_NOSCRIPTS = 1 << 3;
    }
}

/// The collaborators an upgrade drives.
#[derive(Clone, Copy)]
pub struct Backends<'a> {
    pub sysroot: &'a dyn Sysroot,
    pub backend: &'a dyn PackageBackend,
    pub initramfs: &'a dyn InitramfsGenerator,
}

/// Construction parameters for [`SysrootUpgrader`].
pub struct UpgraderOpts<'a> {
    pub backends: Backends<'a>,
    /// The OS to upgrade; `None` means the booted one.
    pub osname: Option<String>,
    pub flags: UpgraderFlags,
}

/// The scratch checkout of the base tree, and what we learned from it.
/// The directory fd is closed when this is dropped; the contents are left
/// behind and removed at the start of the next run.
struct Checkout {
    rootfs: Dir,
    path: Utf8PathBuf,
    devino: DevInoCache,
    sack: PackageSack,
}

/// One upgrade attempt for one OS.
pub struct SysrootUpgrader<'a> {
    backends: Backends<'a>,
    flags: UpgraderFlags,
    osname: String,
    /// Where `/etc` is merged from.
    cfg_merge: Deployment,
    /// Where the origin and base revision come from.
    origin_merge: Deployment,
    origin: Origin,
    base_revision: String,
    final_revision: Option<String>,
    overlay_packages: Vec<String>,
    summary: Option<TransactionSummary>,
}

impl<'a> SysrootUpgrader<'a> {
    #[context("Initializing upgrader")]
    pub fn new(opts: UpgraderOpts<'a>) -> Result<Self> {
        let sysroot = opts.backends.sysroot;
        let osname = match opts.osname {
            Some(o) if o.is_empty() => return Err(UpgradeError::config("Invalid empty osname")),
            Some(o) => o,
            None => sysroot
                .booted_deployment()
                .map(|d| d.osname)
                .ok_or_else(|| {
                    UpgradeError::config(
                        "Not currently booted into an OSTree system and no OS specified",
                    )
                })?,
        };
        let no_previous =
            || UpgradeError::consistency(format!("No previous deployment for OS '{osname}'"));
        let cfg_merge = syscore::merge_deployment(sysroot, &osname).ok_or_else(no_previous)?;
        let origin_merge =
            syscore::origin_merge_deployment(sysroot, &osname).ok_or_else(no_previous)?;
        let origin_text = origin_merge.origin.as_deref().ok_or_else(|| {
            UpgradeError::consistency(format!(
                "No origin known for deployment {}",
                origin_merge.id()
            ))
        })?;
        let mut origin = Origin::new_from_str(origin_text)?;
        if let Some(msg) = origin.unconfigured_state() {
            if !opts.flags.contains(UpgraderFlags::IGNORE_UNCONFIGURED) {
                return Err(UpgradeError::config(format!(
                    "origin unconfigured-state: {msg}"
                )));
            }
        }
        origin.remove_transient_state();

        let info = syscore::deployment_get_layered_info(sysroot.repo(), &origin_merge)?;
        let (base_revision, final_revision) = match info.base_commit {
            Some(base) if info.is_layered => (base, Some(origin_merge.csum.clone())),
            _ => (origin_merge.csum.clone(), None),
        };
        tracing::debug!(
            "upgrader for {osname}: merge={} origin-merge={} base={base_revision}",
            cfg_merge.id(),
            origin_merge.id()
        );
        Ok(Self {
            backends: opts.backends,
            flags: opts.flags,
            osname,
            cfg_merge,
            origin_merge,
            origin,
            base_revision,
            final_revision,
            overlay_packages: Vec::new(),
            summary: None,
        })
    }

    pub fn osname(&self) -> &str {
        &self.osname
    }

    pub fn flags(&self) -> UpgraderFlags {
        self.flags
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// A copy of the origin, to be modified and handed back with
    /// [`Self::set_origin`].
    pub fn dup_origin(&self) -> Origin {
        self.origin.clone()
    }

    pub fn set_origin(&mut self, origin: Origin) {
        self.origin = origin;
    }

    /// The unlayered base commit.
    pub fn base(&self) -> &str {
        &self.base_revision
    }

    /// The layered commit, if one has been (or was previously) assembled.
    pub fn final_revision(&self) -> Option<&str> {
        self.final_revision.as_deref()
    }

    /// The deployment whose configuration is merged into the new one.
    pub fn merge_deployment(&self) -> &Deployment {
        &self.cfg_merge
    }

    pub fn origin_merge_deployment(&self) -> &Deployment {
        &self.origin_merge
    }

    /// Requested packages not already provided by the base.  Only
    /// meaningful after [`Self::deploy`].
    pub fn overlay_packages(&self) -> &[String] {
        &self.overlay_packages
    }

    /// The resolved package transaction of the last assembly; `None` when
    /// there was no package work.
    pub fn transaction_summary(&self) -> Option<&TransactionSummary> {
        self.summary.as_ref()
    }

    /// Fetch the base named by the origin and make it the new base
    /// revision.  Returns whether it changed.
    #[context("Pulling base")]
    pub fn pull(
        &mut self,
        dir_to_pull: Option<&str>,
        flags: PullFlags,
        progress: Option<&dyn ProgressSink>,
        cancellable: &Cancellable,
    ) -> Result<bool> {
        cancellable.set_error_if_cancelled()?;
        let repo = self.backends.sysroot.repo();
        let refspec = self.origin.refspec().to_string();
        let override_commit = self.origin.override_commit().map(String::from);

        let new_base = match self.origin.refspec_type() {
            RefspecType::Checksum => {
                if !repo.has_commit(&refspec)? {
                    return Err(anyhow!("Commit {refspec} not found in repo"));
                }
                refspec.clone()
            }
            RefspecType::Ostree => {
                let (remote, branch) = parse_refspec(&refspec)?;
                if let Some(remote) = remote.as_deref() {
                    let target = override_commit.as_deref().unwrap_or(branch.as_str());
                    let r = repo.pull(remote, dir_to_pull, &[target], flags, progress, cancellable);
                    if let Some(p) = progress {
                        p.finish();
                    }
                    r?;
                }
                match override_commit {
                    Some(c) => {
                        // Point the ref at what we deploy, so the commit is retained
                        repo.set_ref_immediate(remote.as_deref(), &branch, Some(&c))?;
                        c
                    }
                    None => repo
                        .resolve_rev(&refspec, false)?
                        .ok_or_else(|| anyhow!("Refspec '{refspec}' not found"))?,
                }
            }
        };

        let changed = new_base != self.base_revision;
        if changed && !self.flags.contains(UpgraderFlags::ALLOW_OLDER) {
            syscore::check_timestamps(repo, &self.base_revision, &new_base)?;
        }
        if changed {
            tracing::info!("New base: {new_base}");
            self.base_revision = new_base;
        }
        Ok(changed)
    }

    /// Whether the finalized package state needs a layered commit.
    fn requires_local_assembly(&self) -> bool {
        !self.overlay_packages.is_empty()
            || !self.origin.local_packages().is_empty()
            || !self.origin.override_remove().is_empty()
            || self.origin.regenerate_initramfs()
    }

    /// Replace any stale scratch checkout with a fresh one of the base.
    #[context("Checking out base tree")]
    fn checkout_base_tree(&self, cancellable: &Cancellable) -> Result<Checkout> {
        cancellable.set_error_if_cancelled()?;
        let repo = self.backends.sysroot.repo();
        let repo_dir = repo.dir();
        repo_dir.remove_all_optional(TMP_ROOTFS_DIR)?;
        if let Some(parent) = camino::Utf8Path::new(TMP_ROOTFS_DIR).parent() {
            repo_dir.create_dir_all(parent)?;
        }
        let msg = format!("Checking out tree {}", shorten_checksum(&self.base_revision));
        let devino = progress_task(&msg, || -> Result<_> {
            let mut devino = DevInoCache::default();
            repo.checkout(
                &self.base_revision,
                None,
                repo_dir,
                TMP_ROOTFS_DIR,
                Some(&mut devino),
                cancellable,
            )?;
            Ok(devino)
        })?;
        let rootfs = repo_dir.open_dir(TMP_ROOTFS_DIR)?;
        let sack = PackageSack::new_from_rpmdb(self.backends.backend.load_rpmdb(&rootfs)?);
        tracing::debug!("base has {} packages", sack.len());
        Ok(Checkout {
            rootfs,
            path: repo.path().join(TMP_ROOTFS_DIR),
            devino,
            sack,
        })
    }

    #[context("Preparing local assembly")]
    fn maybe_do_local_assembly(&mut self, cancellable: &Cancellable) -> Result<()> {
        let b = self.backends;
        let mut checkout = self.checkout_base_tree(cancellable)?;
        finalize_overrides(&mut self.origin, &checkout.sack)?;
        self.overlay_packages = finalize_packages_to_overlay(
            &self.origin,
            &mut checkout.sack,
            b.sysroot.pkgcache(),
            b.backend,
            cancellable,
        )?;
        if !self.requires_local_assembly() {
            tracing::debug!("all requested packages are in the base");
            self.final_revision = None;
            return Ok(());
        }
        self.do_local_assembly(&mut checkout, cancellable)
    }

    #[context("Assembling layered tree")]
    fn do_local_assembly(&mut self, checkout: &mut Checkout, cancellable: &Cancellable) -> Result<()> {
        let b = self.backends;
        let noscripts = self.flags.contains(UpgraderFlags::PKGOVERLAY_NOSCRIPTS);
        let merge_root = b
            .sysroot
            .path()
            .join(b.sysroot.deployment_dirpath(&self.cfg_merge));
        let sepolicy = crate::sepolicy::load(&checkout.rootfs)?;
        let sepolicy_csum = sepolicy.as_ref().map(|p| p.csum.clone());
        let config = ContextConfig {
            source_root: checkout.path.clone(),
            repos_dir: merge_root.join("etc/yum.repos.d"),
            passwd_dir: merge_root.join("etc"),
            sepolicy,
        };
        let treespec = Treespec::new(&self.overlay_packages, &self.origin);
        let mut ctx = b.backend.new_context(config, b.sysroot.pkgcache())?;

        cancellable.set_error_if_cancelled()?;
        let have_packages = treespec.has_packages();
        self.summary = if have_packages {
            Some(ctx.prepare(&treespec, cancellable)?)
        } else {
            ctx.set_is_empty();
            None
        };

        if self.flags.contains(UpgraderFlags::DRY_RUN) {
            if let Some(summary) = self.summary.as_ref() {
                print!("{}", summary.render());
            }
            return Ok(());
        }

        if have_packages {
            cancellable.set_error_if_cancelled()?;
            ctx.download(cancellable)?;
            cancellable.set_error_if_cancelled()?;
            ctx.import(cancellable)?;
            cancellable.set_error_if_cancelled()?;
            ctx.relabel(cancellable)?;
        }

        // Anything assembled before is superseded from here on
        self.final_revision = None;

        if have_packages {
            cancellable.set_error_if_cancelled()?;
            ctx.assemble(&checkout.rootfs, &mut checkout.devino, noscripts, cancellable)?;
        }
        drop(ctx);

        crate::postprocess::rootfs_postprocess_common(&checkout.rootfs)?;

        if self.origin.regenerate_initramfs() {
            cancellable.set_error_if_cancelled()?;
            let layout = crate::kernel::find_kernel(&checkout.rootfs)?;
            let args = self.origin.initramfs_args();
            let initramfs = progress_task("Generating initramfs", || {
                b.initramfs
                    .generate(&checkout.rootfs, &layout.kver, args, cancellable)
            })?;
            crate::kernel::finalize_kernel(&checkout.rootfs, &layout, initramfs)?;
        }

        cancellable.set_error_if_cancelled()?;
        let repo = b.sysroot.repo();
        let base = repo.load_commit(&self.base_revision)?;
        let mut packages: Vec<String> = treespec.packages.clone();
        packages.extend(self.origin.local_packages().keys().cloned());
        let mut metadata = btreemap! {
            CLIENTLAYER_KEY.to_string() => json!(true),
            CLIENTLAYER_VERSION_KEY.to_string() => json!(CLIENTLAYER_VERSION),
            SPEC_KEY.to_string() => treespec.to_json()?,
            PACKAGES_KEY.to_string() => json!(packages),
            REMOVED_BASE_PACKAGES_KEY.to_string() => json!(self.summary.as_ref().map(|s| s.remove.clone()).unwrap_or_default()),
        };
        if let Some(v) = base.version() {
            metadata.insert(VERSION_KEY.to_string(), json!(v));
        }
        if let Some(csum) = sepolicy_csum {
            metadata.insert(SEPOLICY_KEY.to_string(), json!(csum));
        }
        let commit = progress_task("Writing OSTree commit", || {
            repo.commit_tree(
                &checkout.rootfs,
                &checkout.devino,
                Some(&self.base_revision),
                metadata,
                cancellable,
            )
        })?;
        tracing::info!("Layered commit: {commit}");
        self.final_revision = Some(commit);
        crate::try_fail_point!(failpoints::ASSEMBLY_AFTER_COMMIT);
        Ok(())
    }

    /// Assemble (if needed) and publish a deployment of the current
    /// origin.  Returns the new deployment, or `None` for a dry run.
    #[context("Deploying")]
    pub fn deploy(&mut self, cancellable: &Cancellable) -> Result<Option<Deployment>> {
        cancellable.set_error_if_cancelled()?;
        if self.origin.may_require_local_assembly() {
            self.maybe_do_local_assembly(cancellable)?;
        } else {
            self.overlay_packages.clear();
            self.final_revision = None;
        }

        if self.flags.contains(UpgraderFlags::DRY_RUN) {
            return Ok(None);
        }

        let sysroot = self.backends.sysroot;
        let repo = sysroot.repo();
        let target = match self.final_revision.as_deref() {
            Some(layered) => {
                // Keep the base alive until the new deployment list is written
                repo.set_ref_immediate(None, TMP_BASE_REF, Some(&self.base_revision))?;
                layered.to_string()
            }
            None => self.base_revision.clone(),
        };
        let origin = self.origin.to_keyfile_string()?;
        let new_deployment = sysroot
            .deploy_tree(
                &self.osname,
                &target,
                &origin,
                Some(&self.cfg_merge),
                cancellable,
            )
            .with_context(|| format!("Deploying {target}"))?;
        crate::try_fail_point!(failpoints::DEPLOY_BEFORE_WRITE);
        cancellable.set_error_if_cancelled()?;

        let deployments = syscore::add_deployment(sysroot, &new_deployment, Some(&self.cfg_merge));
        syscore::write_deployments(sysroot, &deployments, cancellable)?;
        tracing::info!("Created deployment {}", new_deployment.id());
        Ok(Some(new_deployment))
    }
}

/// Drop removal overrides for packages the base no longer has.
pub fn finalize_overrides(origin: &mut Origin, sack: &PackageSack) -> Result<()> {
    let stale: Vec<String> = origin
        .override_remove()
        .iter()
        .filter(|name| sack.query_name(name).next().is_none())
        .cloned()
        .collect();
    for name in &stale {
        tracing::info!("Dropping removal override for '{name}': not in base");
    }
    if !stale.is_empty() {
        origin.remove_overrides(&stale)?;
    }
    Ok(())
}

/// Load local packages into `sack` and split the requested patterns into
/// those already satisfied by the base and those to layer; the latter are
/// returned.
#[context("Finalizing packages to overlay")]
pub fn finalize_packages_to_overlay(
    origin: &Origin,
    sack: &mut PackageSack,
    pkgcache: &dyn Repo,
    backend: &dyn PackageBackend,
    cancellable: &Cancellable,
) -> Result<Vec<String>> {
    let local = origin.local_packages();
    if !local.is_empty() {
        let tmpdir = tempfile::Builder::new()
            .prefix("rpmostree-localpkgmeta-")
            .tempdir()?;
        let tmppath = Utf8PathBuf::try_from(tmpdir.path().to_path_buf())?;
        progress_n_items("Processing local packages", local.len() as u64, |update| {
            for (i, (nevra, sha256)) in local.iter().enumerate() {
                cancellable.set_error_if_cancelled()?;
                let header = find_pkg_header(pkgcache, nevra, Some(sha256))?;
                let path = tmppath.join(format!("{nevra}.rpm"));
                std::fs::write(&path, header).with_context(|| format!("Writing {path}"))?;
                let pkg = backend.read_header(&path)?;
                let pkg_nevra = pkg.nevra();
                if sack.has_base_nevra(&pkg_nevra) {
                    return Err(UpgradeError::conflict(format!(
                        "Package '{pkg_nevra}' is already in the base"
                    )));
                }
                sack.add_cmdline_package(pkg);
                update(i as u64 + 1);
            }
            Ok::<_, anyhow::Error>(())
        })?;
    }

    let mut overlay = Vec::new();
    for pattern in origin.packages() {
        let mut matches = sack.matching(pattern).peekable();
        if matches.peek().is_none() {
            overlay.push(pattern.clone());
            continue;
        }
        for m in matches {
            if m.source == PackageSource::Commandline {
                continue;
            }
            if origin.override_remove().contains(&m.pkg.name) {
                return Err(UpgradeError::conflict(format!(
                    "Cannot request '{pattern}' provided by removed package '{}'",
                    m.pkg.nevra()
                )));
            }
        }
        tracing::debug!("'{pattern}' is provided by the base");
    }
    Ok(overlay)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rpmutils::{Nevra, PackageMeta};

    fn pkg(nevra: &str) -> PackageMeta {
        PackageMeta::from_nevra(&Nevra::parse(nevra).unwrap())
    }

    fn origin_with(extra: &str) -> Origin {
        Origin::new_from_str(format!("[origin]\nrefspec=fedora:fedora/x86_64/coreos\n{extra}"))
            .unwrap()
    }

    #[test]
    fn stale_overrides() -> Result<()> {
        let sack = PackageSack::new_from_rpmdb([pkg("foo-1.0-1.x86_64")]);
        let mut origin = origin_with("[overrides]\nremove=foo;gone;\n");
        finalize_overrides(&mut origin, &sack)?;
        assert_eq!(
            origin.override_remove().iter().collect::<Vec<_>>(),
            vec!["foo"]
        );
        let empty = PackageSack::default();
        finalize_overrides(&mut origin, &empty)?;
        assert!(origin.override_remove().is_empty());
        Ok(())
    }

    #[test]
    fn overlay_split() -> Result<()> {
        let mut webserver = pkg("httpd-2.4.51-1.fc35.x86_64");
        webserver.provides.push("webserver".into());
        let mut sack = PackageSack::new_from_rpmdb([pkg("vim-minimal-2:8.2-1.fc35.x86_64"), webserver]);
        let origin = origin_with("[packages]\nrequested=vim-minimal;webserver;tmux;\n");
        let td = tempfile::tempdir()?;
        let repo = crate::testutils::MemoryRepo::new(td.path())?;
        let backend = crate::testutils::FakeBackend::default();
        let overlay = finalize_packages_to_overlay(
            &origin,
            &mut sack,
            &repo,
            &backend,
            &Cancellable::new(),
        )?;
        assert_eq!(overlay, vec!["tmux".to_string()]);
        Ok(())
    }
}
