/*
 * Copyright (C) 2018 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! # Test utilities
//!
//! In-memory implementations of the store and backend traits, good enough
//! to drive whole upgrades in unit and integration tests.  Commit
//! metadata and refs live in memory; file content is stored on disk and
//! hardlinked into checkouts, like a real repository does.  Subject to
//! change.

use crate::context::{AssemblyContext, ContextConfig, PackageBackend, TransactionSummary};
use crate::error::UpgradeError;
use crate::initramfs::InitramfsGenerator;
use crate::pkgcache::find_pkg_header;
use crate::progress::ProgressSink;
use crate::rpmutils::{Nevra, PackageMeta, RPMDB_LOCATION};
use crate::store::{CommitInfo, Deployment, DevInoCache, PullFlags, Repo, Sysroot};
use crate::sysroot_upgrade::{Backends, SysrootUpgrader, UpgraderFlags, UpgraderOpts};
use crate::treespec::Treespec;
use crate::utils::{decompose_sha256_nevra, format_refspec, is_checksum};
use crate::utils::{sha256_hex, Cancellable};
use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::{Dir, MetadataExt, Permissions, PermissionsExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use serde_derive::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

/// The OS name used by [`Fixture`].
pub const OSNAME: &str = "fedora";
/// The remote and branch used by [`Fixture`].
pub const REMOTE: &str = "fedora";
pub const BRANCH: &str = "fedora/x86_64/coreos";
/// The package database of a test tree.
pub const RPMDB_JSON: &str = "usr/share/rpm/rpmdb.json";
/// The kernel version in trees built by [`base_tree_files`].
pub const KVER: &str = "5.14.10-300.fc35.x86_64";

const OBJECTS: &str = "objects";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
enum TreeEntry {
    Dir { mode: u32 },
    File { checksum: String, mode: u32 },
    Symlink { target: String },
}

#[derive(Debug, Clone)]
struct StoredCommit {
    info: CommitInfo,
    tree: BTreeMap<String, TreeEntry>,
}

#[derive(Debug)]
struct RepoState {
    commits: HashMap<String, StoredCommit>,
    refs: BTreeMap<String, String>,
    /// Branch heads as served by remotes, keyed by `remote:branch`.
    upstream: BTreeMap<String, String>,
    pulls: Vec<String>,
    /// Subpaths requested by partial pulls.
    partial_pulls: Vec<String>,
    clock: u64,
    devino_hits: usize,
}

impl Default for RepoState {
    fn default() -> Self {
        Self {
            commits: Default::default(),
            refs: Default::default(),
            upstream: Default::default(),
            pulls: Default::default(),
            partial_pulls: Default::default(),
            clock: 1_600_000_000,
            devino_hits: 0,
        }
    }
}

/// A repository keeping commits in memory and file objects on disk.
#[derive(Debug)]
pub struct MemoryRepo {
    path: Utf8PathBuf,
    dir: Dir,
    objects: Dir,
    state: RefCell<RepoState>,
}

fn object_checksum(contents: &[u8], mode: u32) -> String {
    let mut buf = format!("{:o}\0", mode & 0o7777).into_bytes();
    buf.extend_from_slice(contents);
    sha256_hex(&buf)
}

impl MemoryRepo {
    /// Create a repository at `path`, which is created if necessary.
    pub fn new(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let path = Utf8PathBuf::try_from(path.to_path_buf())?;
        let dir = Dir::open_ambient_dir(&path, cap_std::ambient_authority())?;
        dir.create_dir_all(OBJECTS)?;
        let objects = dir.open_dir(OBJECTS)?;
        Ok(Self {
            path,
            dir,
            objects,
            state: Default::default(),
        })
    }

    fn write_object(&self, contents: &[u8], mode: u32) -> Result<String> {
        let checksum = object_checksum(contents, mode);
        if !self.objects.try_exists(&checksum)? {
            self.objects.atomic_write_with_perms(
                &checksum,
                contents,
                Permissions::from_mode(mode & 0o7777),
            )?;
        }
        Ok(checksum)
    }

    fn scan_tree(
        &self,
        d: &Dir,
        prefix: &str,
        devino: &DevInoCache,
        out: &mut BTreeMap<String, TreeEntry>,
    ) -> Result<()> {
        for ent in d.entries()? {
            let ent = ent?;
            let name = ent
                .file_name()
                .into_string()
                .map_err(|n| anyhow!("Invalid filename {n:?}"))?;
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let ft = ent.file_type()?;
            let meta = d.symlink_metadata(&name)?;
            if ft.is_dir() {
                out.insert(path.clone(), TreeEntry::Dir { mode: meta.mode() & 0o7777 });
                self.scan_tree(&d.open_dir(&name)?, &path, devino, out)?;
            } else if ft.is_symlink() {
                let target = d.read_link_contents(&name)?;
                out.insert(
                    path,
                    TreeEntry::Symlink {
                        target: target.to_string_lossy().into_owned(),
                    },
                );
            } else {
                let mode = meta.mode() & 0o7777;
                let checksum = match devino.lookup(meta.dev(), meta.ino()) {
                    Some(c) => {
                        self.state.borrow_mut().devino_hits += 1;
                        c.to_string()
                    }
                    None => self.write_object(&d.read(&name)?, mode)?,
                };
                out.insert(path, TreeEntry::File { checksum, mode });
            }
        }
        Ok(())
    }

    fn commit_with_timestamp(
        &self,
        rootfs: &Dir,
        devino: &DevInoCache,
        parent: Option<&str>,
        metadata: BTreeMap<String, serde_json::Value>,
        timestamp: Option<u64>,
    ) -> Result<String> {
        let mut tree = BTreeMap::new();
        self.scan_tree(rootfs, "", devino, &mut tree)?;
        let mut state = self.state.borrow_mut();
        let timestamp = timestamp.unwrap_or_else(|| {
            state.clock += 3600;
            state.clock
        });
        let buf = serde_json::to_vec(&(parent, timestamp, &metadata, &tree))?;
        let checksum = sha256_hex(&buf);
        state.commits.insert(
            checksum.clone(),
            StoredCommit {
                info: CommitInfo {
                    parent: parent.map(String::from),
                    timestamp,
                    metadata,
                },
                tree,
            },
        );
        Ok(checksum)
    }

    /// Commit a tree given as a map of path to contents; parent
    /// directories are implied.
    pub fn commit_files(
        &self,
        parent: Option<&str>,
        files: &BTreeMap<String, Vec<u8>>,
        metadata: BTreeMap<String, serde_json::Value>,
        timestamp: Option<u64>,
    ) -> Result<String> {
        let td = cap_std_ext::cap_tempfile::tempdir(cap_std::ambient_authority())?;
        for (path, contents) in files {
            if let Some(parent) = Utf8Path::new(path).parent() {
                if !parent.as_str().is_empty() {
                    td.create_dir_all(parent)?;
                }
            }
            td.write(path, contents)?;
            td.set_permissions(path, Permissions::from_mode(0o644))?;
        }
        self.commit_with_timestamp(&td, &DevInoCache::default(), parent, metadata, timestamp)
    }

    /// Make `rev` the head of `branch` as served by `remote`.
    pub fn publish(&self, remote: &str, branch: &str, rev: &str) {
        self.state
            .borrow_mut()
            .upstream
            .insert(format_refspec(Some(remote), branch), rev.to_string());
    }

    /// The head of `branch` as served by `remote`.
    pub fn upstream_head(&self, remote: &str, branch: &str) -> Option<String> {
        self.state
            .borrow()
            .upstream
            .get(&format_refspec(Some(remote), branch))
            .cloned()
    }

    /// The refs passed to [`Repo::pull`] so far, as `remote:ref`.
    pub fn pulls(&self) -> Vec<String> {
        self.state.borrow().pulls.clone()
    }

    pub fn partial_pulls(&self) -> Vec<String> {
        self.state.borrow().partial_pulls.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.state.borrow().commits.len()
    }

    /// Number of files whose checksum was taken from a [`DevInoCache`].
    pub fn devino_hits(&self) -> usize {
        self.state.borrow().devino_hits
    }

    pub fn refs(&self) -> BTreeMap<String, String> {
        self.state.borrow().refs.clone()
    }

    /// Read a file from a commit, or `None` if it has no such file.
    pub fn read_file(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.borrow();
        let commit = state
            .commits
            .get(rev)
            .ok_or_else(|| anyhow!("No such commit {rev}"))?;
        match commit.tree.get(path) {
            Some(TreeEntry::File { checksum, .. }) => Ok(Some(self.objects.read(checksum)?)),
            Some(_) => bail!("{path} is not a regular file"),
            None => Ok(None),
        }
    }

    /// All paths in a commit.
    pub fn list_paths(&self, rev: &str) -> Result<Vec<String>> {
        let state = self.state.borrow();
        let commit = state
            .commits
            .get(rev)
            .ok_or_else(|| anyhow!("No such commit {rev}"))?;
        Ok(commit.tree.keys().cloned().collect())
    }
}

impl Repo for MemoryRepo {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn dir(&self) -> &Dir {
        &self.dir
    }

    fn pull(
        &self,
        remote: &str,
        dir_to_pull: Option<&str>,
        refs: &[&str],
        _flags: PullFlags,
        progress: Option<&dyn ProgressSink>,
        cancellable: &Cancellable,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(d) = dir_to_pull {
            state.partial_pulls.push(d.to_string());
        }
        for &r in refs {
            cancellable.set_error_if_cancelled()?;
            let refspec = format_refspec(Some(remote), r);
            if let Some(p) = progress {
                p.message(&format!("Receiving objects: {refspec}"));
            }
            state.pulls.push(refspec.clone());
            if is_checksum(r) {
                if !state.commits.contains_key(r) {
                    bail!("Remote {remote} has no commit {r}");
                }
                continue;
            }
            let head = state
                .upstream
                .get(&refspec)
                .cloned()
                .ok_or_else(|| anyhow!("No such branch {r} in remote {remote}"))?;
            state.refs.insert(refspec, head);
        }
        Ok(())
    }

    fn resolve_rev(&self, refspec: &str, allow_noent: bool) -> Result<Option<String>> {
        let state = self.state.borrow();
        if is_checksum(refspec) && state.commits.contains_key(refspec) {
            return Ok(Some(refspec.to_string()));
        }
        match state.refs.get(refspec) {
            Some(r) => Ok(Some(r.clone())),
            None if allow_noent => Ok(None),
            None => bail!("Refspec '{refspec}' not found"),
        }
    }

    fn set_ref_immediate(
        &self,
        remote: Option<&str>,
        name: &str,
        checksum: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let refspec = format_refspec(remote, name);
        match checksum {
            Some(c) => {
                if !state.commits.contains_key(c) {
                    bail!("No such commit {c}");
                }
                state.refs.insert(refspec, c.to_string());
            }
            None => {
                state.refs.remove(&refspec);
            }
        }
        Ok(())
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .borrow()
            .refs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn load_commit(&self, checksum: &str) -> Result<CommitInfo> {
        self.state
            .borrow()
            .commits
            .get(checksum)
            .map(|c| c.info.clone())
            .ok_or_else(|| anyhow!("No such commit {checksum}"))
    }

    fn has_commit(&self, checksum: &str) -> Result<bool> {
        Ok(self.state.borrow().commits.contains_key(checksum))
    }

    fn checkout(
        &self,
        rev: &str,
        subpath: Option<&str>,
        dest: &Dir,
        dest_path: &str,
        mut devino: Option<&mut DevInoCache>,
        cancellable: &Cancellable,
    ) -> Result<()> {
        cancellable.set_error_if_cancelled()?;
        let tree = self
            .state
            .borrow()
            .commits
            .get(rev)
            .map(|c| c.tree.clone())
            .ok_or_else(|| anyhow!("No such commit {rev}"))?;
        dest.create_dir(dest_path)
            .with_context(|| format!("Creating {dest_path}"))?;
        let root = dest.open_dir(dest_path)?;
        for (path, ent) in tree.iter() {
            if let Some(sub) = subpath {
                let under = path
                    .strip_prefix(sub)
                    .map(|r| r.is_empty() || r.starts_with('/'))
                    .unwrap_or(false);
                if !under {
                    continue;
                }
            }
            if let Some(parent) = Utf8Path::new(path).parent() {
                if !parent.as_str().is_empty() {
                    root.create_dir_all(parent)?;
                }
            }
            match ent {
                TreeEntry::Dir { mode } => {
                    root.create_dir_all(path)?;
                    root.set_permissions(path, Permissions::from_mode(*mode))?;
                }
                TreeEntry::Symlink { target } => {
                    root.symlink_contents(target, path)?;
                }
                TreeEntry::File { checksum, .. } => {
                    self.objects.hard_link(checksum, &root, path)?;
                    if let Some(devino) = devino.as_deref_mut() {
                        let meta = root.symlink_metadata(path)?;
                        devino.insert(meta.dev(), meta.ino(), checksum.as_str());
                    }
                }
            }
        }
        Ok(())
    }

    fn commit_tree(
        &self,
        rootfs: &Dir,
        devino: &DevInoCache,
        parent: Option<&str>,
        metadata: BTreeMap<String, serde_json::Value>,
        cancellable: &Cancellable,
    ) -> Result<String> {
        cancellable.set_error_if_cancelled()?;
        self.commit_with_timestamp(rootfs, devino, parent, metadata, None)
    }
}

#[derive(Debug, Default)]
struct SysrootState {
    deployments: Vec<Deployment>,
    booted: Option<Deployment>,
    serials: HashMap<(String, String), u32>,
    write_count: usize,
}

/// A sysroot in a temporary directory, backed by [`MemoryRepo`]s.
#[derive(Debug)]
pub struct MemorySysroot {
    _tempdir: tempfile::TempDir,
    path: Utf8PathBuf,
    repo: MemoryRepo,
    pkgcache: MemoryRepo,
    state: RefCell<SysrootState>,
}

impl MemorySysroot {
    pub fn new() -> Result<Self> {
        let tempdir = tempfile::Builder::new().prefix("rpmostree-sysroot-").tempdir()?;
        let path = Utf8PathBuf::try_from(tempdir.path().to_path_buf())?;
        let repo_path = path.join("ostree/repo");
        let repo = MemoryRepo::new(repo_path.as_std_path())?;
        let pkgcache = MemoryRepo::new(repo_path.join("extensions/rpmostree/pkgcache").as_std_path())?;
        Ok(Self {
            _tempdir: tempdir,
            path,
            repo,
            pkgcache,
            state: Default::default(),
        })
    }

    pub fn memory_repo(&self) -> &MemoryRepo {
        &self.repo
    }

    pub fn memory_pkgcache(&self) -> &MemoryRepo {
        &self.pkgcache
    }

    /// Deploy `rev` for `osname`, publish it and boot into it, as on a
    /// freshly installed machine.
    pub fn install(&self, osname: &str, rev: &str, origin: &str) -> Result<Deployment> {
        let c = Cancellable::new();
        let d = self.deploy_tree(osname, rev, origin, None, &c)?;
        let mut deployments = self.deployments();
        deployments.insert(0, d.clone());
        self.write_deployments(&deployments, &c)?;
        self.set_booted(Some(d.clone()));
        Ok(d)
    }

    pub fn set_booted(&self, d: Option<Deployment>) {
        self.state.borrow_mut().booted = d;
    }

    /// How many times the deployment list has been written.
    pub fn write_count(&self) -> usize {
        self.state.borrow().write_count
    }
}

impl Sysroot for MemorySysroot {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn repo(&self) -> &dyn Repo {
        &self.repo
    }

    fn pkgcache(&self) -> &dyn Repo {
        &self.pkgcache
    }

    fn deployments(&self) -> Vec<Deployment> {
        self.state.borrow().deployments.clone()
    }

    fn booted_deployment(&self) -> Option<Deployment> {
        self.state.borrow().booted.clone()
    }

    fn deployment_dirpath(&self, d: &Deployment) -> Utf8PathBuf {
        format!("ostree/deploy/{}/deploy/{}.{}", d.osname, d.csum, d.deployserial).into()
    }

    fn deploy_tree(
        &self,
        osname: &str,
        revision: &str,
        origin: &str,
        _merge_deployment: Option<&Deployment>,
        cancellable: &Cancellable,
    ) -> Result<Deployment> {
        cancellable.set_error_if_cancelled()?;
        let deployserial = {
            let mut state = self.state.borrow_mut();
            let serial = state
                .serials
                .entry((osname.to_string(), revision.to_string()))
                .or_insert(0);
            let r = *serial;
            *serial += 1;
            r
        };
        let d = Deployment {
            osname: osname.to_string(),
            csum: revision.to_string(),
            deployserial,
            bootcsum: sha256_hex(revision.as_bytes()),
            origin: Some(origin.to_string()),
            pinned: false,
            staged: false,
        };
        let dirpath = self.deployment_dirpath(&d);
        let sysroot = self.open_dir()?;
        if let Some(parent) = dirpath.parent() {
            sysroot.create_dir_all(parent)?;
        }
        self.repo
            .checkout(revision, None, &sysroot, dirpath.as_str(), None, cancellable)?;
        Ok(d)
    }

    fn write_deployments(&self, deployments: &[Deployment], cancellable: &Cancellable) -> Result<()> {
        cancellable.set_error_if_cancelled()?;
        let mut state = self.state.borrow_mut();
        state.deployments = deployments.to_vec();
        state.write_count += 1;
        Ok(())
    }
}

/// Load a test tree's package database.
fn read_rpmdb(rootfs: &Dir) -> Result<Vec<PackageMeta>> {
    let Some(d) = rootfs.open_dir_optional(RPMDB_LOCATION)? else {
        return Ok(Vec::new());
    };
    if !d.try_exists("rpmdb.json")? {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&d.read("rpmdb.json")?)?)
}

/// A package backend resolving against a fixed set of available
/// packages and recording every step it is asked to perform.
#[derive(Debug, Default)]
pub struct FakeBackend {
    available: RefCell<Vec<PackageMeta>>,
    events: RefCell<Vec<String>>,
}

impl FakeBackend {
    /// Make `pkg` installable from the "repos".
    pub fn add_available(&self, pkg: PackageMeta) {
        self.available.borrow_mut().push(pkg);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    fn event(&self, e: impl Into<String>) {
        self.events.borrow_mut().push(e.into());
    }
}

impl PackageBackend for FakeBackend {
    fn load_rpmdb(&self, rootfs: &Dir) -> Result<Vec<PackageMeta>> {
        read_rpmdb(rootfs)
    }

    fn read_header(&self, path: &Utf8Path) -> Result<PackageMeta> {
        let buf = std::fs::read(path).with_context(|| format!("Reading {path}"))?;
        Ok(serde_json::from_slice(&buf)?)
    }

    fn new_context<'a>(
        &'a self,
        config: ContextConfig,
        pkgcache: &'a dyn Repo,
    ) -> Result<Box<dyn AssemblyContext + 'a>> {
        self.event(format!(
            "new-context sepolicy={}",
            config.sepolicy.as_ref().map(|p| p.name.as_str()).unwrap_or("none")
        ));
        Ok(Box::new(FakeContext {
            backend: self,
            config,
            pkgcache,
            install: Vec::new(),
            remove: Vec::new(),
        }))
    }
}

struct FakeContext<'a> {
    backend: &'a FakeBackend,
    config: ContextConfig,
    pkgcache: &'a dyn Repo,
    install: Vec<PackageMeta>,
    remove: Vec<Nevra>,
}

fn package_file_contents(pkg: &PackageMeta) -> String {
    format!("{}\n", pkg.nevra())
}

impl AssemblyContext for FakeContext<'_> {
    fn prepare(&mut self, treespec: &Treespec, cancellable: &Cancellable) -> Result<TransactionSummary> {
        cancellable.set_error_if_cancelled()?;
        self.backend.event("prepare");
        let rootfs = Dir::open_ambient_dir(&self.config.source_root, cap_std::ambient_authority())?;
        let base = read_rpmdb(&rootfs)?;
        for name in &treespec.removed_base_packages {
            let found: Vec<_> = base.iter().filter(|p| &p.name == name).collect();
            if found.is_empty() {
                return Err(UpgradeError::resolution(format!(
                    "Cannot remove '{name}': not installed"
                )));
            }
            self.remove.extend(found.into_iter().map(|p| p.nevra()));
        }
        let available = self.backend.available.borrow();
        let mut missing = Vec::new();
        for pattern in &treespec.packages {
            match available.iter().find(|p| p.matches(pattern)) {
                Some(p) => self.install.push(p.clone()),
                None => missing.push(pattern.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(UpgradeError::resolution(format!(
                "Packages not found: {}",
                missing.join(", ")
            )));
        }
        for cached in &treespec.cached_packages {
            let (nevra, sha256) = decompose_sha256_nevra(cached)?;
            let header = find_pkg_header(self.pkgcache, nevra, Some(sha256))?;
            self.install.push(serde_json::from_slice(&header)?);
        }
        Ok(TransactionSummary {
            install: self.install.iter().map(|p| p.nevra().to_string()).collect(),
            remove: self.remove.iter().map(|n| n.to_string()).collect(),
        })
    }

    fn set_is_empty(&mut self) {
        self.backend.event("set-is-empty");
    }

    fn download(&mut self, _cancellable: &Cancellable) -> Result<()> {
        self.backend.event("download");
        Ok(())
    }

    fn import(&mut self, _cancellable: &Cancellable) -> Result<()> {
        self.backend.event("import");
        Ok(())
    }

    fn relabel(&mut self, _cancellable: &Cancellable) -> Result<()> {
        self.backend.event("relabel");
        Ok(())
    }

    fn assemble(
        &mut self,
        rootfs: &Dir,
        _devino: &mut DevInoCache,
        noscripts: bool,
        cancellable: &Cancellable,
    ) -> Result<()> {
        cancellable.set_error_if_cancelled()?;
        self.backend.event(format!("assemble noscripts={noscripts}"));
        // Packages install to /etc; the tree keeps it in /usr/etc.
        if rootfs.try_exists("usr/etc")? {
            rootfs.rename("usr/etc", rootfs, "etc")?;
        }
        let mut rpmdb = read_rpmdb(rootfs)?;
        for pkg in rpmdb.iter().filter(|p| self.remove.contains(&p.nevra())) {
            for f in &pkg.files {
                rootfs.remove_file_optional(f.trim_start_matches('/'))?;
            }
        }
        rpmdb.retain(|p| !self.remove.contains(&p.nevra()));
        for pkg in &self.install {
            for f in &pkg.files {
                let f = f.trim_start_matches('/');
                if let Some(parent) = Utf8Path::new(f).parent() {
                    if !parent.as_str().is_empty() {
                        rootfs.create_dir_all(parent)?;
                    }
                }
                // Never write through a hardlink into the object store
                rootfs.remove_file_optional(f)?;
                rootfs.write(f, package_file_contents(pkg))?;
            }
            rpmdb.push(pkg.clone());
        }
        rpmdb.sort_by(|a, b| a.name.cmp(&b.name));
        rootfs.create_dir_all(RPMDB_LOCATION)?;
        rootfs.atomic_replace_with(RPMDB_JSON, |w| -> Result<()> {
            serde_json::to_writer_pretty(w, &rpmdb)?;
            Ok(())
        })?;
        Ok(())
    }
}

/// An initramfs generator writing a recognizable placeholder.
#[derive(Debug, Default)]
pub struct FakeInitramfs {
    calls: Cell<usize>,
}

impl FakeInitramfs {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// The contents generated for `kver` with `args`.
    pub fn contents(kver: &str, args: &[String]) -> String {
        format!("initramfs for {kver} args={}\n", args.join(" "))
    }
}

impl InitramfsGenerator for FakeInitramfs {
    fn generate(
        &self,
        rootfs: &Dir,
        kver: &str,
        args: &[String],
        cancellable: &Cancellable,
    ) -> Result<std::fs::File> {
        cancellable.set_error_if_cancelled()?;
        if !rootfs.try_exists(format!("usr/lib/modules/{kver}"))? {
            bail!("No modules for {kver}");
        }
        self.calls.set(self.calls.get() + 1);
        let mut f = tempfile::tempfile()?;
        f.write_all(Self::contents(kver, args).as_bytes())?;
        Ok(f)
    }
}

/// A package named by `nevra`, owning `/usr/bin/<name>`.
pub fn pkg(nevra: &str) -> PackageMeta {
    let n = Nevra::parse(nevra).expect("valid nevra");
    let mut p = PackageMeta::from_nevra(&n);
    p.files.push(format!("/usr/bin/{}", n.name));
    p
}

/// The files of a bootable tree with the given packages installed.
pub fn base_tree_files(pkgs: &[PackageMeta]) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    files.insert(
        format!("usr/lib/modules/{KVER}/vmlinuz"),
        b"kernel".to_vec(),
    );
    files.insert(
        format!("usr/lib/modules/{KVER}/initramfs.img"),
        b"base initramfs".to_vec(),
    );
    files.insert(
        "usr/etc/selinux/config".to_string(),
        b"SELINUX=enforcing\nSELINUXTYPE=targeted\n".to_vec(),
    );
    files.insert(
        "usr/etc/selinux/targeted/policy/policy.33".to_string(),
        b"policy".to_vec(),
    );
    files.insert(
        "usr/etc/yum.repos.d/fedora.repo".to_string(),
        b"[fedora]\nenabled=1\n".to_vec(),
    );
    for p in pkgs {
        for f in &p.files {
            files.insert(
                f.trim_start_matches('/').to_string(),
                package_file_contents(p).into_bytes(),
            );
        }
    }
    let mut rpmdb = pkgs.to_vec();
    rpmdb.sort_by(|a, b| a.name.cmp(&b.name));
    files.insert(
        RPMDB_JSON.to_string(),
        serde_json::to_vec_pretty(&rpmdb).expect("serialize rpmdb"),
    );
    files
}

/// Import `pkg` into the package cache as if from a local file; returns
/// the `sha256:NEVRA` to request it with.
pub fn import_local_package(pkgcache: &MemoryRepo, pkg: &PackageMeta) -> Result<String> {
    let td = tempfile::tempdir()?;
    let path = Utf8PathBuf::try_from(td.path().join(format!("{}.rpm", pkg.nevra())))?;
    std::fs::write(&path, serde_json::to_vec(pkg)?)?;
    crate::pkgcache::import_local_package(
        pkgcache,
        &FakeBackend::default(),
        &path,
        &Cancellable::new(),
    )
}

/// A booted machine running one OS, plus the collaborators an upgrade
/// needs.
#[derive(Debug)]
pub struct Fixture {
    pub sysroot: MemorySysroot,
    pub backend: FakeBackend,
    pub initramfs: FakeInitramfs,
    /// The commit initially deployed.
    pub base: String,
}

impl Fixture {
    /// Boot a tree with `pkgs` installed, tracking the remote branch.
    pub fn new(pkgs: &[&str]) -> Result<Self> {
        Self::new_with_origin(pkgs, "")
    }

    /// Like [`Fixture::new`], with extra origin keyfile groups.
    pub fn new_with_origin(pkgs: &[&str], extra_origin: &str) -> Result<Self> {
        let sysroot = MemorySysroot::new()?;
        let pkgs: Vec<_> = pkgs.iter().map(|p| pkg(p)).collect();
        let base = commit_version(sysroot.memory_repo(), None, &pkgs, "35.20211001.0", None)?;
        let repo = sysroot.memory_repo();
        repo.publish(REMOTE, BRANCH, &base);
        repo.set_ref_immediate(Some(REMOTE), BRANCH, Some(&base))?;
        let origin = format!(
            "[origin]\nrefspec={}\n{extra_origin}",
            format_refspec(Some(REMOTE), BRANCH)
        );
        sysroot.install(OSNAME, &base, &origin)?;
        Ok(Self {
            sysroot,
            backend: FakeBackend::default(),
            initramfs: FakeInitramfs::default(),
            base,
        })
    }

    pub fn backends(&self) -> Backends<'_> {
        Backends {
            sysroot: &self.sysroot,
            backend: &self.backend,
            initramfs: &self.initramfs,
        }
    }

    pub fn upgrader(&self, flags: UpgraderFlags) -> Result<SysrootUpgrader<'_>> {
        SysrootUpgrader::new(UpgraderOpts {
            backends: self.backends(),
            osname: None,
            flags,
        })
    }

    pub fn repo(&self) -> &MemoryRepo {
        self.sysroot.memory_repo()
    }

    /// Publish a new upstream commit with `pkgs` on the tracked branch,
    /// on top of the current head.
    pub fn publish_update(
        &self,
        pkgs: &[&str],
        version: &str,
        timestamp: Option<u64>,
    ) -> Result<String> {
        let pkgs: Vec<_> = pkgs.iter().map(|p| pkg(p)).collect();
        let parent = self.repo().upstream_head(REMOTE, BRANCH);
        let rev = commit_version(self.repo(), parent.as_deref(), &pkgs, version, timestamp)?;
        self.repo().publish(REMOTE, BRANCH, &rev);
        Ok(rev)
    }
}

fn commit_version(
    repo: &MemoryRepo,
    parent: Option<&str>,
    pkgs: &[PackageMeta],
    version: &str,
    timestamp: Option<u64>,
) -> Result<String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("version".to_string(), serde_json::json!(version));
    repo.commit_files(parent, &base_tree_files(pkgs), metadata, timestamp)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_repo_roundtrip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = MemoryRepo::new(td.path())?;
        let files = base_tree_files(&[pkg("foo-1.0-1.x86_64")]);
        let rev = repo.commit_files(None, &files, BTreeMap::new(), None)?;
        assert!(repo.has_commit(&rev)?);
        assert_eq!(repo.read_file(&rev, "usr/bin/foo")?.unwrap(), b"foo-1.0-1.x86_64\n");

        let c = Cancellable::new();
        let mut devino = DevInoCache::default();
        repo.checkout(&rev, None, repo.dir(), "co", Some(&mut devino), &c)?;
        assert_eq!(devino.len(), files.len());
        let co = repo.dir().open_dir("co")?;
        // An unmodified checkout commits to the same content without
        // reading any file
        let rev2 = repo.commit_tree(&co, &devino, None, BTreeMap::new(), &c)?;
        assert_eq!(repo.devino_hits(), files.len());
        assert_eq!(repo.list_paths(&rev)?, repo.list_paths(&rev2)?);

        repo.checkout(&rev, Some(RPMDB_LOCATION), repo.dir(), "rpmdb", None, &c)?;
        let rpmdb = read_rpmdb(&repo.dir().open_dir("rpmdb")?)?;
        assert_eq!(rpmdb.len(), 1);
        assert!(!repo.dir().try_exists("rpmdb/usr/bin")?);
        Ok(())
    }

    #[test]
    fn refs() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = MemoryRepo::new(td.path())?;
        let rev = repo.commit_files(None, &BTreeMap::new(), BTreeMap::new(), None)?;
        let c = Cancellable::new();
        assert!(repo.pull("origin", None, &["main"], PullFlags::empty(), None, &c).is_err());
        repo.publish("origin", "main", &rev);
        repo.pull("origin", None, &["main"], PullFlags::empty(), None, &c)?;
        assert_eq!(repo.resolve_rev("origin:main", false)?.as_deref(), Some(rev.as_str()));
        assert_eq!(repo.resolve_rev("other", true)?, None);
        assert!(repo.resolve_rev("other", false).is_err());
        repo.set_ref_immediate(None, "rpmostree/base/0", Some(&rev))?;
        assert_eq!(repo.list_refs("rpmostree/base/")?, vec!["rpmostree/base/0"]);
        repo.set_ref_immediate(None, "rpmostree/base/0", None)?;
        assert!(repo.list_refs("rpmostree/base/")?.is_empty());
        Ok(())
    }
}
