//! An "origin" declares how we generated an OSTree commit.
//!
//! It is stored alongside each deployment as a keyfile. We keep the parsed
//! keyfile around (so unknown keys survive a round trip) along with a cache
//! of the fields we care about, and update both on every mutation.

/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use crate::utils::{compose_sha256_nevra, decompose_sha256_nevra, is_checksum};
use anyhow::{anyhow, bail, Context, Result};
use ini::Ini;
use std::collections::{BTreeMap, BTreeSet};

const ORIGIN: &str = "origin";
const REFSPEC: &str = "refspec";
const BASEREFSPEC: &str = "baserefspec";
const OVERRIDE_COMMIT: &str = "override-commit";
const UNCONFIGURED_STATE: &str = "unconfigured-state";
const PACKAGES: &str = "packages";
const REQUESTED: &str = "requested";
const REQUESTED_LOCAL: &str = "requested-local";
const OVERRIDES: &str = "overrides";
const REMOVE: &str = "remove";
const RPMOSTREE: &str = "rpmostree";
const REGENERATE_INITRAMFS: &str = "regenerate-initramfs";
const INITRAMFS_ARGS: &str = "initramfs-args";
/// Transient key written by `ostree admin unlock`.
const UNLOCKED: &str = "unlocked";
const LIVE_GROUP: &str = "rpmostree-ex-live";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefspecType {
    /// A `remote:branch` or local branch name.
    Ostree,
    /// A bare commit checksum.
    Checksum,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Refspec {
    pub kind: RefspecType,
    pub value: String,
}

impl Refspec {
    fn new(value: &str) -> Self {
        let kind = if is_checksum(value) {
            RefspecType::Checksum
        } else {
            RefspecType::Ostree
        };
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
struct Cache {
    refspec: Refspec,
    override_commit: Option<String>,
    unconfigured_state: Option<String>,

    packages: BTreeSet<String>,
    /// NEVRA → sha256
    packages_local: BTreeMap<String, String>,
    override_remove: BTreeSet<String>,

    regenerate_initramfs: bool,
    initramfs_args: Vec<String>,
}

/// The desired state of one OS.
#[derive(Clone, Debug)]
pub struct Origin {
    kf: Ini,
    cache: Cache,
}

/// Parse a glib-style string list: `a;b;c;`.
fn split_stringlist(v: &str) -> impl Iterator<Item = &str> {
    v.split(';').filter(|s| !s.is_empty())
}

fn join_stringlist<S: AsRef<str>>(items: impl IntoIterator<Item = S>) -> String {
    let mut r = String::new();
    for it in items {
        r.push_str(it.as_ref());
        r.push(';');
    }
    r
}

fn keyfile_get_optional_string(kf: &Ini, group: &str, key: &str) -> Option<String> {
    kf.get_from(Some(group), key).map(|v| v.to_string())
}

fn keyfile_get_nonempty_optional_string(kf: &Ini, group: &str, key: &str) -> Option<String> {
    keyfile_get_optional_string(kf, group, key).filter(|v| !v.is_empty())
}

fn parse_stringlist(kf: &Ini, group: &str, key: &str) -> BTreeSet<String> {
    kf.get_from(Some(group), key)
        .map(|v| split_stringlist(v).map(String::from).collect())
        .unwrap_or_default()
}

fn parse_localpkglist(kf: &Ini, group: &str, key: &str) -> Result<BTreeMap<String, String>> {
    let mut r = BTreeMap::new();
    if let Some(v) = kf.get_from(Some(group), key) {
        for it in split_stringlist(v) {
            let (nevra, sha256) = decompose_sha256_nevra(it)?;
            r.insert(nevra.to_string(), sha256.to_string());
        }
    }
    Ok(r)
}

fn parse_boolean(kf: &Ini, group: &str, key: &str) -> Result<bool> {
    match kf.get_from(Some(group), key).map(str::trim) {
        None => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(o) => bail!("Invalid boolean for {group}/{key}: {o}"),
    }
}

/// Remove a key, and its group if that leaves it empty.
fn keyfile_remove_key(kf: &mut Ini, group: &str, key: &str) {
    kf.delete_from(Some(group), key);
    if kf.section(Some(group)).map(|s| s.iter().next().is_none()).unwrap_or(false) {
        kf.delete(Some(group));
    }
}

fn keyfile_set(kf: &mut Ini, group: &str, key: &str, value: impl Into<String>) {
    kf.set_to(Some(group), key.to_string(), value.into());
}

/// Set a list key, or drop it entirely if the list is empty.
fn keyfile_set_stringlist<S: AsRef<str>>(
    kf: &mut Ini,
    group: &str,
    key: &str,
    items: impl IntoIterator<Item = S>,
) {
    let v = join_stringlist(items);
    if v.is_empty() {
        keyfile_remove_key(kf, group, key);
    } else {
        keyfile_set(kf, group, key, v);
    }
}

impl Origin {
    pub fn new_from_str(s: impl AsRef<str>) -> Result<Self> {
        let kf = Ini::load_from_str(s.as_ref()).context("Parsing origin")?;
        Self::new_parse(kf)
    }

    fn new_parse(kf: Ini) -> Result<Self> {
        let refspec_str = keyfile_get_nonempty_optional_string(&kf, ORIGIN, REFSPEC)
            .or_else(|| keyfile_get_nonempty_optional_string(&kf, ORIGIN, BASEREFSPEC))
            .ok_or_else(|| {
                anyhow!("No origin/refspec or origin/baserefspec in current deployment origin; cannot handle via rpm-ostree")
            })?;
        let refspec = Refspec::new(&refspec_str);
        let override_commit = keyfile_get_nonempty_optional_string(&kf, ORIGIN, OVERRIDE_COMMIT);
        let unconfigured_state =
            keyfile_get_nonempty_optional_string(&kf, ORIGIN, UNCONFIGURED_STATE);
        let packages = parse_stringlist(&kf, PACKAGES, REQUESTED);
        let packages_local = parse_localpkglist(&kf, PACKAGES, REQUESTED_LOCAL)?;
        let override_remove = parse_stringlist(&kf, OVERRIDES, REMOVE);
        let regenerate_initramfs = parse_boolean(&kf, RPMOSTREE, REGENERATE_INITRAMFS)?;
        let initramfs_args = kf
            .get_from(Some(RPMOSTREE), INITRAMFS_ARGS)
            .map(|v| split_stringlist(v).map(String::from).collect())
            .unwrap_or_default();
        Ok(Self {
            kf,
            cache: Cache {
                refspec,
                override_commit,
                unconfigured_state,
                packages,
                packages_local,
                override_remove,
                regenerate_initramfs,
                initramfs_args,
            },
        })
    }

    /// Serialize back to keyfile text, as stored next to a deployment.
    pub fn to_keyfile_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.kf.write_to(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

// Accessors
impl Origin {
    pub fn refspec(&self) -> &str {
        self.cache.refspec.value.as_str()
    }

    pub fn refspec_type(&self) -> RefspecType {
        self.cache.refspec.kind
    }

    pub fn override_commit(&self) -> Option<&str> {
        self.cache.override_commit.as_deref()
    }

    pub fn unconfigured_state(&self) -> Option<&str> {
        self.cache.unconfigured_state.as_deref()
    }

    pub fn packages(&self) -> &BTreeSet<String> {
        &self.cache.packages
    }

    /// Local packages, as a map from NEVRA to sha256.
    pub fn local_packages(&self) -> &BTreeMap<String, String> {
        &self.cache.packages_local
    }

    pub fn override_remove(&self) -> &BTreeSet<String> {
        &self.cache.override_remove
    }

    pub fn regenerate_initramfs(&self) -> bool {
        self.cache.regenerate_initramfs
    }

    pub fn initramfs_args(&self) -> &[String] {
        &self.cache.initramfs_args
    }

    pub fn custom_url(&self) -> Option<String> {
        keyfile_get_nonempty_optional_string(&self.kf, ORIGIN, "custom-url")
    }

    /// Whether this origin asks for anything on top of the base tree.
    pub fn may_require_local_assembly(&self) -> bool {
        self.cache.regenerate_initramfs
            || !self.cache.packages.is_empty()
            || !self.cache.packages_local.is_empty()
            || !self.cache.override_remove.is_empty()
    }
}

// Mutators
impl Origin {
    /// Store the refspec under `baserefspec` when the deployment may be
    /// layered, and under `refspec` otherwise.
    fn sync_baserefspec(&mut self) {
        let (set, unset) = if self.may_require_local_assembly() {
            (BASEREFSPEC, REFSPEC)
        } else {
            (REFSPEC, BASEREFSPEC)
        };
        let v = self.cache.refspec.value.clone();
        keyfile_remove_key(&mut self.kf, ORIGIN, unset);
        keyfile_set(&mut self.kf, ORIGIN, set, v);
    }

    pub fn remove_transient_state(&mut self) {
        keyfile_remove_key(&mut self.kf, ORIGIN, UNLOCKED);
        self.kf.delete(Some(LIVE_GROUP));
    }

    /// Pin (or unpin) the base to a specific commit. The version, if
    /// provided, is informational only.
    pub fn set_override_commit(&mut self, checksum: Option<(&str, Option<&str>)>) {
        match checksum {
            Some((checksum, ver)) => {
                keyfile_set(&mut self.kf, ORIGIN, OVERRIDE_COMMIT, checksum);
                self.cache.override_commit = Some(checksum.to_string());
                if let Some(ver) = ver {
                    tracing::debug!("override commit {checksum} is version {ver}");
                }
            }
            None => {
                keyfile_remove_key(&mut self.kf, ORIGIN, OVERRIDE_COMMIT);
                self.cache.override_commit = None;
            }
        }
    }

    /// Switch to a new refspec.  Any override commit is dropped.
    pub fn set_rebase(&mut self, new_refspec: &str) -> Result<()> {
        if new_refspec.is_empty() {
            bail!("Invalid empty refspec");
        }
        self.set_override_commit(None);
        self.cache.refspec = Refspec::new(new_refspec);
        self.sync_baserefspec();
        Ok(())
    }

    fn update_keyfile_pkgs(&mut self) {
        keyfile_set_stringlist(&mut self.kf, PACKAGES, REQUESTED, &self.cache.packages);
        let local = self
            .cache
            .packages_local
            .iter()
            .map(|(nevra, sha256)| compose_sha256_nevra(nevra, sha256))
            .collect::<Vec<_>>();
        keyfile_set_stringlist(&mut self.kf, PACKAGES, REQUESTED_LOCAL, local);
        self.sync_baserefspec();
    }

    fn update_keyfile_overrides(&mut self) {
        keyfile_set_stringlist(&mut self.kf, OVERRIDES, REMOVE, &self.cache.override_remove);
        self.sync_baserefspec();
    }

    /// Request packages; for `local`, each entry is `sha256:NEVRA`.
    /// Returns whether anything changed.  Nothing is modified on error.
    pub fn add_packages<S: AsRef<str>>(&mut self, pkgs: &[S], local: bool) -> Result<bool> {
        let mut packages = self.cache.packages.clone();
        let mut packages_local = self.cache.packages_local.clone();
        for pkg in pkgs.iter().map(|p| p.as_ref()) {
            if local {
                let (nevra, sha256) = decompose_sha256_nevra(pkg)?;
                if packages_local.contains_key(nevra) || packages.contains(nevra) {
                    bail!("Package '{nevra}' is already requested");
                }
                packages_local.insert(nevra.to_string(), sha256.to_string());
            } else {
                if packages.contains(pkg) || packages_local.contains_key(pkg) {
                    bail!("Package/capability '{pkg}' is already requested");
                }
                packages.insert(pkg.to_string());
            }
        }
        if pkgs.is_empty() {
            return Ok(false);
        }
        self.cache.packages = packages;
        self.cache.packages_local = packages_local;
        self.update_keyfile_pkgs();
        Ok(true)
    }

    /// Drop package requests; each must currently be requested, either
    /// as a pattern or as a local package NEVRA.  Nothing is modified on
    /// error.
    pub fn remove_packages<S: AsRef<str>>(&mut self, pkgs: &[S]) -> Result<bool> {
        let mut packages = self.cache.packages.clone();
        let mut packages_local = self.cache.packages_local.clone();
        for pkg in pkgs.iter().map(|p| p.as_ref()) {
            if !packages.remove(pkg) && packages_local.remove(pkg).is_none() {
                bail!("Package/capability '{pkg}' is not currently requested");
            }
        }
        if pkgs.is_empty() {
            return Ok(false);
        }
        self.cache.packages = packages;
        self.cache.packages_local = packages_local;
        self.update_keyfile_pkgs();
        Ok(true)
    }

    /// Mark base packages for removal.
    pub fn add_override_remove<S: AsRef<str>>(&mut self, pkgs: &[S]) -> Result<()> {
        let mut override_remove = self.cache.override_remove.clone();
        for pkg in pkgs.iter().map(|p| p.as_ref()) {
            if !override_remove.insert(pkg.to_string()) {
                bail!("Override already exists for package '{pkg}'");
            }
        }
        self.cache.override_remove = override_remove;
        self.update_keyfile_overrides();
        Ok(())
    }

    /// Drop removal overrides; each must exist.
    pub fn remove_overrides<S: AsRef<str>>(&mut self, pkgs: &[S]) -> Result<()> {
        let mut override_remove = self.cache.override_remove.clone();
        for pkg in pkgs.iter().map(|p| p.as_ref()) {
            if !override_remove.remove(pkg) {
                bail!("No overrides for package '{pkg}'");
            }
        }
        self.cache.override_remove = override_remove;
        self.update_keyfile_overrides();
        Ok(())
    }

    /// Drop every override.  Returns whether there were any.
    pub fn remove_all_overrides(&mut self) -> bool {
        let changed = !self.cache.override_remove.is_empty();
        self.cache.override_remove.clear();
        self.update_keyfile_overrides();
        changed
    }

    pub fn set_regenerate_initramfs<S: AsRef<str>>(&mut self, regenerate: bool, args: &[S]) {
        self.cache.regenerate_initramfs = regenerate;
        self.cache.initramfs_args = args.iter().map(|s| s.as_ref().to_string()).collect();
        keyfile_set(
            &mut self.kf,
            RPMOSTREE,
            REGENERATE_INITRAMFS,
            if regenerate { "true" } else { "false" },
        );
        keyfile_set_stringlist(
            &mut self.kf,
            RPMOSTREE,
            INITRAMFS_ARGS,
            &self.cache.initramfs_args,
        );
        self.sync_baserefspec();
    }
}
