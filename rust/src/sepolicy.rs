//! Detection of the SELinux policy shipped in a tree.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use openssl::sha::Sha256;

const CONFIG_PATHS: &[&str] = &["usr/etc/selinux", "etc/selinux"];

/// The policy a tree will be labeled with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SePolicy {
    /// e.g. `targeted`.
    pub name: String,
    /// Policy directory, relative to the tree root.
    pub path: Utf8PathBuf,
    /// Checksum over the compiled policy, used to detect when a layered
    /// commit needs relabeling.
    pub csum: String,
}

fn parse_selinuxtype(config: &str) -> Option<&str> {
    config
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .find_map(|l| l.strip_prefix("SELINUXTYPE="))
        .map(|v| v.trim().trim_matches('"'))
        .filter(|v| !v.is_empty())
}

/// Find the SELinux policy of the tree at `rootfs`, if it has one.
#[context("Loading SELinux policy")]
pub fn load(rootfs: &Dir) -> Result<Option<SePolicy>> {
    for &base in CONFIG_PATHS {
        let Some(selinux) = rootfs.open_dir_optional(base)? else {
            continue;
        };
        if !selinux.try_exists("config")? {
            continue;
        }
        let config = selinux.read_to_string("config").context("Reading config")?;
        let Some(name) = parse_selinuxtype(&config) else {
            tracing::debug!("No SELINUXTYPE in {base}/config");
            return Ok(None);
        };
        let Some(policydir) = selinux.open_dir_optional(format!("{name}/policy"))? else {
            tracing::debug!("No policy directory for {name}");
            return Ok(None);
        };
        let mut names = Vec::new();
        for ent in policydir.entries()? {
            let ent = ent?;
            if ent.file_type()?.is_file() {
                if let Ok(n) = ent.file_name().into_string() {
                    names.push(n);
                }
            }
        }
        names.sort();
        let mut h = Sha256::new();
        for n in &names {
            h.update(n.as_bytes());
            h.update(&policydir.read(n)?);
        }
        let csum = hex::encode(h.finish());
        return Ok(Some(SePolicy {
            name: name.to_string(),
            path: Utf8PathBuf::from(format!("{base}/{name}")),
            csum,
        }));
    }
    tracing::debug!("No SELinux configuration found");
    Ok(None)
}
