//! Lookups in the local package cache repository.
//!
//! Every imported package lives on a branch named after its NEVRA (see
//! [`nevra_to_cache_branch`]); the commit metadata carries the package
//! header and the checksum of the original package file.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::context::PackageBackend;
use crate::rpmutils::nevra_to_cache_branch;
use crate::store::{CommitInfo, DevInoCache, Repo};
use crate::utils::{compose_sha256_nevra, sha256_hex, Cancellable};
use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_tempfile;
use fn_error_context::context;
use maplit::btreemap;
use serde_json::json;

/// Commit metadata key holding the package header.
pub const HEADER_KEY: &str = "rpmostree.metadata";
/// Commit metadata key holding the sha256 of the package file.
pub const SHA256_KEY: &str = "rpmostree.sha256";

fn metadata_bytes(info: &CommitInfo, key: &str) -> Option<Vec<u8>> {
    match info.metadata.get(key)? {
        serde_json::Value::String(s) => Some(s.as_bytes().to_vec()),
        serde_json::Value::Array(a) => a
            .iter()
            .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect(),
        _ => None,
    }
}

/// Return the header of the cached package `nevra`, verifying that it
/// was imported from a file with checksum `expected_sha256`.
#[context("Loading cached header for {}", nevra)]
pub fn find_pkg_header(
    pkgcache: &dyn Repo,
    nevra: &str,
    expected_sha256: Option<&str>,
) -> Result<Vec<u8>> {
    let branch = nevra_to_cache_branch(nevra)?;
    let rev = pkgcache
        .resolve_rev(&branch, true)?
        .ok_or_else(|| anyhow!("Failed to find cached package for {nevra}"))?;
    let info = pkgcache.load_commit(&rev)?;
    if let Some(expected) = expected_sha256 {
        let actual = info
            .metadata_str(SHA256_KEY)
            .ok_or_else(|| anyhow!("Cached package {nevra} has no {SHA256_KEY}"))?;
        if actual != expected {
            bail!("Checksum mismatch for package {nevra}: expected {expected}, found {actual}");
        }
    }
    metadata_bytes(&info, HEADER_KEY)
        .ok_or_else(|| anyhow!("Cached package {nevra} has no header"))
}

/// Import the package file at `path` into the cache, returning the
/// `sha256:NEVRA` an origin requests it by.
#[context("Importing {}", path)]
pub fn import_local_package(
    pkgcache: &dyn Repo,
    backend: &dyn PackageBackend,
    path: &Utf8Path,
    cancellable: &Cancellable,
) -> Result<String> {
    let contents = std::fs::read(path).context("Reading package")?;
    let pkg = backend.read_header(path)?;
    let nevra = pkg.nevra().to_string();
    let sha256 = sha256_hex(&contents);
    let header = match std::str::from_utf8(&contents) {
        Ok(s) => json!(s),
        Err(_) => json!(contents),
    };
    let metadata = btreemap! {
        HEADER_KEY.to_string() => header,
        SHA256_KEY.to_string() => json!(sha256),
    };
    // Payloads are unpacked at assembly time; the cache commit only
    // carries the header.
    let empty = cap_tempfile::tempdir(cap_std::ambient_authority())?;
    let rev = pkgcache.commit_tree(&empty, &DevInoCache::default(), None, metadata, cancellable)?;
    pkgcache.set_ref_immediate(None, &nevra_to_cache_branch(&nevra)?, Some(&rev))?;
    tracing::debug!("imported {nevra} as {rev}");
    Ok(compose_sha256_nevra(&nevra, &sha256))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutils::{pkg, FakeBackend, MemoryRepo};

    #[test]
    fn header_encodings() {
        let info = CommitInfo {
            metadata: btreemap! {
                "a".to_string() => json!("hdr"),
                "b".to_string() => json!([104, 100, 114]),
                "c".to_string() => json!([1024]),
                "d".to_string() => json!(42),
            },
            ..Default::default()
        };
        assert_eq!(metadata_bytes(&info, "a").as_deref(), Some(&b"hdr"[..]));
        assert_eq!(metadata_bytes(&info, "b").as_deref(), Some(&b"hdr"[..]));
        assert_eq!(metadata_bytes(&info, "c"), None);
        assert_eq!(metadata_bytes(&info, "d"), None);
        assert_eq!(metadata_bytes(&info, "e"), None);
    }

    #[test]
    fn import_and_find() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = MemoryRepo::new(&td.path().join("pkgcache"))?;
        let p = pkg("baz-1.0-1.x86_64");
        let path = camino::Utf8PathBuf::try_from(td.path().join("baz.rpm"))?;
        std::fs::write(&path, serde_json::to_vec(&p)?)?;
        let c = Cancellable::new();
        let sha256_nevra = import_local_package(&repo, &FakeBackend::default(), &path, &c)?;
        let (nevra, sha256) = crate::utils::decompose_sha256_nevra(&sha256_nevra)?;
        assert_eq!(nevra, "baz-1.0-1.x86_64");
        let header = find_pkg_header(&repo, nevra, Some(sha256))?;
        assert_eq!(serde_json::from_slice::<crate::rpmutils::PackageMeta>(&header)?, p);
        let e = find_pkg_header(&repo, nevra, Some("00")).unwrap_err();
        assert!(format!("{e:#}").contains("Checksum mismatch"));
        assert!(find_pkg_header(&repo, "other-1-1.x86_64", None).is_err());
        Ok(())
    }
}
