//! The object store and sysroot primitives the upgrader drives.
//!
//! These are implemented by the host's OSTree bindings; the upgrader only
//! sequences them.  See `testutils` for an in-memory implementation.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::progress::ProgressSink;
use crate::utils::Cancellable;
use anyhow::Result;
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use std::collections::{BTreeMap, HashMap};

/// Ref protecting the base commit of a freshly layered commit until the
/// deployment list that references it has been written.
pub const TMP_BASE_REF: &str = "rpmostree/base/tmp";
/// Prefix for refs keeping the base commits of layered deployments alive.
pub const BASE_REF_PREFIX: &str = "rpmostree/base/";
/// Scratch checkout location, relative to the repo directory.
pub const TMP_ROOTFS_DIR: &str = "extensions/rpmostree/commit";

/// Commit metadata key marking a client-side layered commit.
pub const CLIENTLAYER_KEY: &str = "rpmostree.clientlayer";
pub const CLIENTLAYER_VERSION_KEY: &str = "rpmostree.clientlayer_version";
/// Commit metadata key holding the embedded treespec.
pub const SPEC_KEY: &str = "rpmostree.spec";
pub const PACKAGES_KEY: &str = "rpmostree.packages";
pub const REMOVED_BASE_PACKAGES_KEY: &str = "rpmostree.removed-base-packages";
pub const SEPOLICY_KEY: &str = "rpmostree.sepolicy";
pub const VERSION_KEY: &str = "version";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PullFlags: u32 {
        const MIRROR = 1 << 0;
        const COMMIT_ONLY = 1 << 1;
        const UNTRUSTED = 1 << 2;
    }
}

/// Maps `(device, inode)` of checked out files to their content
/// checksum, so committing an unmodified file is cheap.
#[derive(Debug, Default, Clone)]
pub struct DevInoCache(HashMap<(u64, u64), String>);

impl DevInoCache {
    pub fn insert(&mut self, dev: u64, ino: u64, checksum: impl Into<String>) {
        self.0.insert((dev, ino), checksum.into());
    }

    pub fn lookup(&self, dev: u64, ino: u64) -> Option<&str> {
        self.0.get(&(dev, ino)).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Commit metadata as the upgrader sees it.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommitInfo {
    pub parent: Option<String>,
    /// Seconds since the epoch.
    pub timestamp: u64,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CommitInfo {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn version(&self) -> Option<&str> {
        self.metadata_str(VERSION_KEY)
    }
}

/// A content-addressed commit repository.
pub trait Repo {
    /// Absolute path to the repository.
    fn path(&self) -> &Utf8Path;

    /// The repository directory.
    fn dir(&self) -> &Dir;

    /// Fetch `refs` (branch names or commit checksums) from `remote`.
    fn pull(
        &self,
        remote: &str,
        dir_to_pull: Option<&str>,
        refs: &[&str],
        flags: PullFlags,
        progress: Option<&dyn ProgressSink>,
        cancellable: &Cancellable,
    ) -> Result<()>;

    /// Resolve a refspec or checksum to a commit checksum.  Returns
    /// `None` for a missing ref when `allow_noent` is set.
    fn resolve_rev(&self, refspec: &str, allow_noent: bool) -> Result<Option<String>>;

    /// Set (or with `None`, delete) a ref, durably.
    fn set_ref_immediate(
        &self,
        remote: Option<&str>,
        name: &str,
        checksum: Option<&str>,
    ) -> Result<()>;

    /// List local refs starting with `prefix`.
    fn list_refs(&self, prefix: &str) -> Result<Vec<String>>;

    fn load_commit(&self, checksum: &str) -> Result<CommitInfo>;

    fn has_commit(&self, checksum: &str) -> Result<bool>;

    /// Check out `rev` to `dest_path` (which must not exist) under
    /// `dest`.  With a `subpath`, only entries below it are written, at
    /// their usual location.  Checked out files are recorded in `devino`.
    fn checkout(
        &self,
        rev: &str,
        subpath: Option<&str>,
        dest: &Dir,
        dest_path: &str,
        devino: Option<&mut DevInoCache>,
        cancellable: &Cancellable,
    ) -> Result<()>;

    /// Write the tree at `rootfs` as a new commit and return its checksum.
    fn commit_tree(
        &self,
        rootfs: &Dir,
        devino: &DevInoCache,
        parent: Option<&str>,
        metadata: BTreeMap<String, serde_json::Value>,
        cancellable: &Cancellable,
    ) -> Result<String>;
}

/// One bootable deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub osname: String,
    pub csum: String,
    pub deployserial: u32,
    pub bootcsum: String,
    /// The origin keyfile, as text.
    pub origin: Option<String>,
    pub pinned: bool,
    pub staged: bool,
}

impl Deployment {
    /// Stable identifier, e.g. `fedora-<csum>.0`.
    pub fn id(&self) -> String {
        format!("{}-{}.{}", self.osname, self.csum, self.deployserial)
    }

    /// Same deployment, ignoring any changed origin or markers.
    pub fn equal(&self, other: &Deployment) -> bool {
        self.osname == other.osname
            && self.csum == other.csum
            && self.deployserial == other.deployserial
    }
}

/// The set of deployments on a machine, and the ability to create and
/// atomically publish new ones.
pub trait Sysroot {
    fn path(&self) -> &Utf8Path;

    /// The system repository.
    fn repo(&self) -> &dyn Repo;

    /// The repository holding imported local packages.
    fn pkgcache(&self) -> &dyn Repo;

    /// Deployments, in boot order.
    fn deployments(&self) -> Vec<Deployment>;

    fn booted_deployment(&self) -> Option<Deployment>;

    /// Path of the deployment root, relative to the sysroot.
    fn deployment_dirpath(&self, deployment: &Deployment) -> Utf8PathBuf;

    /// Create (but do not publish) a deployment of `revision`, merging
    /// configuration from `merge_deployment`.
    fn deploy_tree(
        &self,
        osname: &str,
        revision: &str,
        origin: &str,
        merge_deployment: Option<&Deployment>,
        cancellable: &Cancellable,
    ) -> Result<Deployment>;

    /// Atomically replace the deployment list.
    fn write_deployments(&self, deployments: &[Deployment], cancellable: &Cancellable)
        -> Result<()>;

    /// Open the sysroot directory.
    fn open_dir(&self) -> Result<Dir> {
        Ok(Dir::open_ambient_dir(self.path(), cap_std::ambient_authority())?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deployment_identity() {
        let a = Deployment {
            osname: "fedora".into(),
            csum: "abc".into(),
            deployserial: 0,
            bootcsum: "b".into(),
            origin: Some("[origin]\nrefspec=foo\n".into()),
            pinned: false,
            staged: false,
        };
        let mut b = a.clone();
        b.origin = None;
        b.pinned = true;
        assert!(a.equal(&b));
        assert_ne!(a, b);
        b.deployserial = 1;
        assert!(!a.equal(&b));
        assert_eq!(a.id(), "fedora-abc.0");
    }

    #[test]
    fn devino() {
        let mut c = DevInoCache::default();
        assert!(c.is_empty());
        c.insert(1, 2, "x");
        assert_eq!(c.lookup(1, 2), Some("x"));
        assert_eq!(c.lookup(2, 1), None);
        assert_eq!(c.len(), 1);
    }
}
