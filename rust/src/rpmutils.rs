//! Helpers for RPM: NEVRA handling, the package cache branch naming,
//! and a small queryable package set ("sack").

/*
 * Copyright (C) 2018 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use anyhow::{anyhow, bail, Result};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Location of the RPM database in a tree.
pub const RPMDB_LOCATION: &str = "usr/share/rpm";
/// Prefix for branches in the package cache repo.
pub const PKGCACHE_BRANCH_PREFIX: &str = "rpmostree/pkg/";

/// A parsed `name-[epoch:]version-release.arch`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nevra {
    pub name: String,
    pub epoch: u64,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl Nevra {
    pub fn parse(s: &str) -> Result<Self> {
        let err = || anyhow!("Invalid NEVRA: {s}");
        let (rest, arch) = s.rsplit_once('.').ok_or_else(err)?;
        let (rest, release) = rest.rsplit_once('-').ok_or_else(err)?;
        let (name, ev) = rest.rsplit_once('-').ok_or_else(err)?;
        let (epoch, version) = match ev.split_once(':') {
            Some((e, v)) => (e.parse::<u64>().map_err(|_| err())?, v),
            None => (0, ev),
        };
        if [name, version, release, arch].iter().any(|v| v.is_empty()) {
            return Err(err());
        }
        Ok(Self {
            name: name.to_string(),
            epoch,
            version: version.to_string(),
            release: release.to_string(),
            arch: arch.to_string(),
        })
    }

    /// `[epoch:]version-release`, omitting a zero epoch.
    pub fn evr(&self) -> String {
        if self.epoch > 0 {
            format!("{}:{}-{}", self.epoch, self.version, self.release)
        } else {
            format!("{}-{}", self.version, self.release)
        }
    }
}

impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}.{}", self.name, self.evr(), self.arch)
    }
}

fn append_quoted(r: &mut String, v: &str) {
    for c in v.chars() {
        match c {
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' => r.push(c),
            '_' => r.push_str("__"),
            c => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    r.push('_');
                    r.push_str(&hex::encode_upper([b]));
                }
            }
        }
    }
}

/// The package cache branch holding the given package.
pub fn nevra_to_cache_branch(nevra: &str) -> Result<String> {
    let n = Nevra::parse(nevra)?;
    let mut r = PKGCACHE_BRANCH_PREFIX.to_string();
    append_quoted(&mut r, &n.name);
    r.push('/');
    append_quoted(&mut r, &n.evr());
    r.push('.');
    append_quoted(&mut r, &n.arch);
    Ok(r)
}

/// The inverse of [`nevra_to_cache_branch`].
pub fn cache_branch_to_nevra(branch: &str) -> Result<String> {
    let cachebranch = branch
        .strip_prefix(PKGCACHE_BRANCH_PREFIX)
        .ok_or_else(|| anyhow!("Missing {PKGCACHE_BRANCH_PREFIX} prefix: {branch}"))?;
    let mut ret = String::new();
    let mut chariter = cachebranch.chars();
    while let Some(c) = chariter.next() {
        if c != '_' {
            match c {
                '/' => ret.push('-'),
                c => ret.push(c),
            }
            continue;
        }
        let c = match chariter.next() {
            Some('_') => {
                ret.push('_');
                continue;
            }
            Some(c) => c,
            None => bail!("Truncated escape in {branch}"),
        };
        let Some(l) = chariter.next() else {
            bail!("Truncated escape in {branch}");
        };
        let mut b = [0u8; 1];
        hex::decode_to_slice(format!("{c}{l}"), &mut b)
            .map_err(|_| anyhow!("Invalid escape in {branch}"))?;
        ret.push(b[0] as char);
    }
    Ok(ret)
}

/// Header data for one package, as recorded in an rpmdb or a package
/// header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMeta {
    pub name: String,
    #[serde(default)]
    pub epoch: u64,
    pub version: String,
    pub release: String,
    pub arch: String,
    /// Capabilities, e.g. `webserver` or `libfoo.so.1()(64bit) = 1.2`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    /// Absolute paths owned by the package.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl PackageMeta {
    pub fn nevra(&self) -> Nevra {
        Nevra {
            name: self.name.clone(),
            epoch: self.epoch,
            version: self.version.clone(),
            release: self.release.clone(),
            arch: self.arch.clone(),
        }
    }

    pub fn from_nevra(n: &Nevra) -> Self {
        Self {
            name: n.name.clone(),
            epoch: n.epoch,
            version: n.version.clone(),
            release: n.release.clone(),
            arch: n.arch.clone(),
            provides: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Whether `pattern` selects this package: by name, by one of the
    /// usual NEVRA spellings, by a provided capability or by an owned
    /// file path.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern.starts_with('/') {
            return self.files.iter().any(|f| f == pattern);
        }
        let n = &self.name;
        let v = &self.version;
        let r = &self.release;
        let a = &self.arch;
        let e = self.epoch;
        let candidates = [
            n.clone(),
            format!("{n}.{a}"),
            format!("{n}-{v}"),
            format!("{n}-{v}-{r}"),
            format!("{n}-{v}-{r}.{a}"),
            format!("{n}-{e}:{v}-{r}"),
            format!("{n}-{e}:{v}-{r}.{a}"),
        ];
        if candidates.iter().any(|c| c == pattern) {
            return true;
        }
        self.provides
            .iter()
            .filter_map(|p| p.split_whitespace().next())
            .any(|p| p == pattern)
    }
}

/// Where a package in a [`PackageSack`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageSource {
    /// Installed in the base tree's rpmdb.
    Base,
    /// Supplied directly, e.g. a local package file.
    Commandline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SackEntry {
    pub pkg: PackageMeta,
    pub source: PackageSource,
}

/// A queryable snapshot of package metadata.
#[derive(Clone, Debug, Default)]
pub struct PackageSack {
    entries: Vec<SackEntry>,
}

impl PackageSack {
    /// Create a sack from the packages installed in a tree.
    pub fn new_from_rpmdb(pkgs: impl IntoIterator<Item = PackageMeta>) -> Self {
        let entries = pkgs
            .into_iter()
            .map(|pkg| SackEntry {
                pkg,
                source: PackageSource::Base,
            })
            .collect();
        Self { entries }
    }

    pub fn add_cmdline_package(&mut self, pkg: PackageMeta) {
        self.entries.push(SackEntry {
            pkg,
            source: PackageSource::Commandline,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All packages selected by `pattern`.
    pub fn matching<'a>(&'a self, pattern: &'a str) -> impl Iterator<Item = &'a SackEntry> + 'a {
        self.entries.iter().filter(move |e| e.pkg.matches(pattern))
    }

    /// Packages whose name is exactly `name`.
    pub fn query_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SackEntry> + 'a {
        self.entries.iter().filter(move |e| e.pkg.name == name)
    }

    /// Whether a base package has exactly this NEVRA.
    pub fn has_base_nevra(&self, nevra: &Nevra) -> bool {
        self.entries
            .iter()
            .any(|e| e.source == PackageSource::Base && &e.pkg.nevra() == nevra)
    }
}
