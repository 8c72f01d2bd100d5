//! The minimal package-set description handed to the assembly context.
//!
//! A treespec is the resolved, immutable form of what an [`Origin`]
//! asks for: which packages to layer from repos, which come from the
//! local package cache, and which base packages to drop.  It is embedded
//! in every layered commit so the result can be reproduced.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::origin::Origin;
use crate::utils::compose_sha256_nevra;
use anyhow::{Context, Result};
use ini::Ini;
use serde_derive::{Deserialize, Serialize};

const TREE: &str = "tree";
const PACKAGES: &str = "packages";
const CACHED_PACKAGES: &str = "cached-packages";
const REMOVED_BASE_PACKAGES: &str = "removed-base-packages";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Treespec {
    /// Patterns to install from the enabled repos.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    /// Local packages, as `sha256:NEVRA`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cached_packages: Vec<String>,
    /// Names of base packages to remove.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_base_packages: Vec<String>,
}

impl Treespec {
    /// Build the treespec from the finalized overlay list and the origin's
    /// local packages and removal overrides.
    pub fn new(overlay_packages: &[String], origin: &Origin) -> Self {
        let cached_packages = origin
            .local_packages()
            .iter()
            .map(|(nevra, sha256)| compose_sha256_nevra(nevra, sha256))
            .collect();
        Self {
            packages: overlay_packages.to_vec(),
            cached_packages,
            removed_base_packages: origin.override_remove().iter().cloned().collect(),
        }
    }

    /// Whether there is any package work at all.
    pub fn has_packages(&self) -> bool {
        !(self.packages.is_empty()
            && self.cached_packages.is_empty()
            && self.removed_base_packages.is_empty())
    }

    /// Serialize as a keyfile with a single `[tree]` group; empty lists
    /// are omitted.
    pub fn to_keyfile_string(&self) -> Result<String> {
        let mut kf = Ini::new();
        for (k, v) in [
            (PACKAGES, &self.packages),
            (CACHED_PACKAGES, &self.cached_packages),
            (REMOVED_BASE_PACKAGES, &self.removed_base_packages),
        ] {
            if v.is_empty() {
                continue;
            }
            let mut joined = v.join(";");
            joined.push(';');
            kf.with_section(Some(TREE)).set(k, joined);
        }
        let mut buf = Vec::new();
        kf.write_to(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    pub fn from_keyfile_str(s: &str) -> Result<Self> {
        let kf = Ini::load_from_str(s).context("Parsing treespec")?;
        let get = |k: &str| -> Vec<String> {
            kf.get_from(Some(TREE), k)
                .map(|v| {
                    v.split(';')
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(Self {
            packages: get(PACKAGES),
            cached_packages: get(CACHED_PACKAGES),
            removed_base_packages: get(REMOVED_BASE_PACKAGES),
        })
    }

    /// The form embedded in commit metadata.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    const C1: &str = "126539c731acf376359aced177dc5dff598dd6714a0a8faf753c727559adc8b5";

    fn origin() -> Origin {
        Origin::new_from_str(indoc::formatdoc! {"
            [origin]
            baserefspec=fedora:fedora/33/x86_64/silverblue

            [packages]
            requested=foo;bar;
            requested-local={C1}:baz-1.0-1.x86_64;

            [overrides]
            remove=nano;vim-minimal;
        "})
        .unwrap()
    }

    #[test]
    fn from_origin() -> Result<()> {
        let o = origin();
        // Only "foo" survived package finalization
        let ts = Treespec::new(&["foo".to_string()], &o);
        assert!(ts.has_packages());
        assert_eq!(ts.packages, ["foo"]);
        assert_eq!(ts.cached_packages, [format!("{C1}:baz-1.0-1.x86_64")]);
        assert_eq!(ts.removed_base_packages, ["nano", "vim-minimal"]);

        let kf = ts.to_keyfile_string()?;
        similar_asserts::assert_eq!(
            kf,
            indoc::formatdoc! {"
                [tree]
                packages=foo;
                cached-packages={C1}:baz-1.0-1.x86_64;
                removed-base-packages=nano;vim-minimal;
            "}
        );
        assert_eq!(Treespec::from_keyfile_str(&kf)?, ts);
        Ok(())
    }

    #[test]
    fn empty_lists_omitted() -> Result<()> {
        let o = Origin::new_from_str("[origin]\nrefspec=foo:bar\n")?;
        let ts = Treespec::new(&[], &o);
        assert!(!ts.has_packages());
        assert_eq!(ts.to_json()?, serde_json::json!({}));
        let ts = Treespec {
            removed_base_packages: vec!["nano".into()],
            ..Default::default()
        };
        assert_eq!(
            ts.to_json()?,
            serde_json::json!({ "removed-base-packages": ["nano"] })
        );
        assert_eq!(
            ts.to_keyfile_string()?,
            indoc! {"
                [tree]
                removed-base-packages=nano;
            "}
        );
        Ok(())
    }

    #[test]
    fn deterministic() -> Result<()> {
        let a = Treespec::new(&["foo".into()], &origin());
        let b = Treespec::new(&["foo".into()], &origin());
        assert_eq!(a.to_keyfile_string()?, b.to_keyfile_string()?);
        assert_eq!(
            serde_json::to_string(&a.to_json()?)?,
            serde_json::to_string(&b.to_json()?)?
        );
        Ok(())
    }
}
