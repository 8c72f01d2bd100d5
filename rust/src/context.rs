//! The boundary to the package backend: reading package metadata, and
//! the assembly context that resolves, downloads and installs packages
//! into a checked out tree.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::rpmutils::PackageMeta;
use crate::sepolicy::SePolicy;
use crate::store::{DevInoCache, Repo};
use crate::treespec::Treespec;
use crate::utils::Cancellable;
use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use serde_derive::Serialize;

/// Cached repository metadata, relative to the sysroot.
pub const CORE_CACHEDIR: &str = "var/cache/rpm-ostree";

/// Where the assembly context finds its inputs.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// The tree being assembled.
    pub source_root: Utf8PathBuf,
    /// Repo definitions, from the merge deployment's `/etc`.
    pub repos_dir: Utf8PathBuf,
    /// `passwd`/`group` database, from the merge deployment's `/etc`.
    pub passwd_dir: Utf8PathBuf,
    pub sepolicy: Option<SePolicy>,
}

/// The result of resolving a treespec against the base.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransactionSummary {
    /// NEVRAs to install.
    pub install: Vec<String>,
    /// NEVRAs to remove from the base.
    pub remove: Vec<String>,
}

impl TransactionSummary {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.remove.is_empty()
    }

    /// Render for display, one package per line.
    pub fn render(&self) -> String {
        let mut r = String::new();
        if self.is_empty() {
            r.push_str("No packages to install or remove.\n");
            return r;
        }
        if !self.install.is_empty() {
            r.push_str(&format!("Installing {} packages:\n", self.install.len()));
            for p in &self.install {
                r.push_str(&format!("  {p}\n"));
            }
        }
        if !self.remove.is_empty() {
            r.push_str(&format!("Removing {} packages:\n", self.remove.len()));
            for p in &self.remove {
                r.push_str(&format!("  {p}\n"));
            }
        }
        r
    }
}

/// Reads package metadata and creates assembly contexts.
pub trait PackageBackend {
    /// Read the installed package database of the tree at `rootfs`.
    fn load_rpmdb(&self, rootfs: &Dir) -> Result<Vec<PackageMeta>>;

    /// Read the metadata of the package (header) file at `path`.
    fn read_header(&self, path: &Utf8Path) -> Result<PackageMeta>;

    /// Create an assembly context; local packages are read from `pkgcache`.
    fn new_context<'a>(
        &'a self,
        config: ContextConfig,
        pkgcache: &'a dyn Repo,
    ) -> Result<Box<dyn AssemblyContext + 'a>>;
}

/// One package assembly run.  Methods are called in order:
/// `prepare` (or `set_is_empty`), `download`, `import`, `relabel`,
/// `assemble`.
pub trait AssemblyContext {
    /// Resolve the treespec against the base and enabled repos.
    fn prepare(&mut self, treespec: &Treespec, cancellable: &Cancellable)
        -> Result<TransactionSummary>;

    /// There is no package work; only the tree itself will be processed.
    fn set_is_empty(&mut self);

    fn download(&mut self, cancellable: &Cancellable) -> Result<()>;

    fn import(&mut self, cancellable: &Cancellable) -> Result<()>;

    /// Bring imported packages in line with the tree's security policy.
    fn relabel(&mut self, cancellable: &Cancellable) -> Result<()>;

    /// Apply the resolved transaction to `rootfs`, recording checked out
    /// files in `devino`.  With `noscripts`, package scripts are skipped.
    fn assemble(
        &mut self,
        rootfs: &Dir,
        devino: &mut DevInoCache,
        noscripts: bool,
        cancellable: &Cancellable,
    ) -> Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_summary() {
        let s = TransactionSummary::default();
        assert_eq!(s.render(), "No packages to install or remove.\n");
        let s = TransactionSummary {
            install: vec!["foo-1.0-1.x86_64".into()],
            remove: vec!["nano-5.8-4.fc35.x86_64".into(), "vim-minimal-2:8.2-1.fc35.x86_64".into()],
        };
        similar_asserts::assert_eq!(
            s.render(),
            indoc::indoc! {"
                Installing 1 packages:
                  foo-1.0-1.x86_64
                Removing 2 packages:
                  nano-5.8-4.fc35.x86_64
                  vim-minimal-2:8.2-1.fc35.x86_64
            "}
        );
    }
}
