//! Finding the kernel in a tree, and installing a regenerated initramfs
//! next to it.
//!
//! Modern trees keep the kernel in `/usr/lib/modules/$kver/vmlinuz` with
//! the initramfs as `initramfs.img` in the same directory.  Older trees
//! use `vmlinuz-$kver` and `initramfs-$kver.img` in `/usr/lib/ostree-boot`
//! or `/boot`, possibly with a `-$bootcsum` suffix.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{bail, Result};
use camino::Utf8PathBuf;
use cap_std::fs::{Dir, Permissions, PermissionsExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use std::io::Seek;

/// The path to the kernel modules
const MODULES: &str = "usr/lib/modules";
/// The default name for the initramfs.
const INITRAMFS: &str = "initramfs.img";
const LEGACY_BOOTDIRS: &[&str] = &["usr/lib/ostree-boot", "boot"];

/// Where the kernel and its initramfs live in a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLayout {
    pub kver: String,
    /// Path to the kernel, relative to the tree root.
    pub kernel_path: Utf8PathBuf,
    /// Path of the current initramfs, if any.
    pub initramfs_path: Option<Utf8PathBuf>,
    /// Directory containing the kernel.
    pub bootdir: Utf8PathBuf,
}

fn find_in_modules(rootfs: &Dir) -> Result<Option<KernelLayout>> {
    let Some(modules) = rootfs.open_dir_optional(MODULES)? else {
        return Ok(None);
    };
    let mut found: Option<KernelLayout> = None;
    for ent in modules.entries()? {
        let ent = ent?;
        if !ent.file_type()?.is_dir() {
            continue;
        }
        let Ok(kver) = ent.file_name().into_string() else {
            continue;
        };
        let kdir = modules.open_dir(&kver)?;
        if !kdir.try_exists("vmlinuz")? {
            continue;
        }
        if let Some(prev) = found.as_ref() {
            bail!("Multiple kernels ({}, {kver}) in {MODULES}", prev.kver);
        }
        let bootdir = Utf8PathBuf::from(format!("{MODULES}/{kver}"));
        let initramfs_path = kdir
            .try_exists(INITRAMFS)?
            .then(|| bootdir.join(INITRAMFS));
        found = Some(KernelLayout {
            kernel_path: bootdir.join("vmlinuz"),
            initramfs_path,
            bootdir,
            kver,
        });
    }
    Ok(found)
}

fn find_in_bootdir(rootfs: &Dir, bootdir: &str) -> Result<Option<KernelLayout>> {
    let Some(d) = rootfs.open_dir_optional(bootdir)? else {
        return Ok(None);
    };
    let mut kernel: Option<String> = None;
    let mut initramfs: Option<String> = None;
    for ent in d.entries()? {
        let ent = ent?;
        if !ent.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = ent.file_name().into_string() else {
            continue;
        };
        if name.starts_with("vmlinuz-") {
            if kernel.is_some() {
                bail!("Multiple vmlinuz- in {bootdir}");
            }
            kernel = Some(name);
        } else if name.starts_with("initramfs-") {
            if initramfs.is_some() {
                bail!("Multiple initramfs- in {bootdir}");
            }
            initramfs = Some(name);
        }
    }
    let Some(kernel) = kernel else {
        return Ok(None);
    };
    let bootdir = Utf8PathBuf::from(bootdir);
    // Strip any trailing -$bootcsum
    let kver = kernel.trim_start_matches("vmlinuz-");
    let kver = match kver.rsplit_once('-') {
        Some((k, csum)) if crate::utils::is_checksum(csum) => k,
        _ => kver,
    };
    Ok(Some(KernelLayout {
        kver: kver.to_string(),
        kernel_path: bootdir.join(&kernel),
        initramfs_path: initramfs.map(|i| bootdir.join(i)),
        bootdir,
    }))
}

/// Locate the single kernel in the tree at `rootfs`.
#[context("Finding kernel")]
pub fn find_kernel(rootfs: &Dir) -> Result<KernelLayout> {
    if let Some(k) = find_in_modules(rootfs)? {
        return Ok(k);
    }
    for bootdir in LEGACY_BOOTDIRS {
        if let Some(k) = find_in_bootdir(rootfs, bootdir)? {
            return Ok(k);
        }
    }
    bail!(
        "Unable to find kernel (vmlinuz) in /{MODULES}, /{}",
        LEGACY_BOOTDIRS.join(", /")
    )
}

fn initramfs_target(layout: &KernelLayout) -> Utf8PathBuf {
    if layout.bootdir.starts_with(MODULES) {
        layout.bootdir.join(INITRAMFS)
    } else {
        layout.bootdir.join(format!("initramfs-{}.img", layout.kver))
    }
}

/// Replace the tree's initramfs with `initramfs`, atomically.
#[context("Finalizing kernel")]
pub fn finalize_kernel(
    rootfs: &Dir,
    layout: &KernelLayout,
    mut initramfs: std::fs::File,
) -> Result<Utf8PathBuf> {
    let target = initramfs_target(layout);
    initramfs.seek(std::io::SeekFrom::Start(0))?;
    rootfs.atomic_replace_with(&target, |w| -> std::io::Result<_> {
        std::io::copy(&mut initramfs, w)
    })?;
    rootfs.set_permissions(&target, Permissions::from_mode(0o644))?;
    // A legacy initramfs with a different name would otherwise shadow ours
    if let Some(old) = layout.initramfs_path.as_deref() {
        if old != target.as_path() {
            rootfs.remove_file_optional(old)?;
        }
    }
    Ok(target)
}
