//! Generating an initramfs for a tree.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::utils::Cancellable;
use anyhow::{anyhow, Context, Result};
use cap_std::fs::Dir;
use cap_std_ext::prelude::CapStdExtCommandExt;
use fn_error_context::context;
use std::io::Seek;
use std::process::{Command, Stdio};

/// Produces an initramfs image for the kernel `kver` in the tree at
/// `rootfs`.
pub trait InitramfsGenerator {
    fn generate(
        &self,
        rootfs: &Dir,
        kver: &str,
        args: &[String],
        cancellable: &Cancellable,
    ) -> Result<std::fs::File>;
}

/// Runs `dracut` inside the target tree via `bwrap`.
#[derive(Debug, Default)]
pub struct Dracut;

impl Dracut {
    fn argv(kver: &str, args: &[String]) -> Vec<String> {
        let mut r: Vec<String> = [
            "--bind", ".", "/", "--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp",
            "--tmpfs", "/var/tmp", "--chdir", "/", "--", "dracut", "-v", "--add", "ostree",
            "--tmpdir=/tmp", "--reproducible", "--stdout",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        r.extend(args.iter().cloned());
        r.push("--kver".to_string());
        r.push(kver.to_string());
        r
    }
}

impl InitramfsGenerator for Dracut {
    #[context("Running dracut")]
    fn generate(
        &self,
        rootfs: &Dir,
        kver: &str,
        args: &[String],
        cancellable: &Cancellable,
    ) -> Result<std::fs::File> {
        cancellable.set_error_if_cancelled()?;
        let mut out = tempfile::tempfile()?;
        let argv = Self::argv(kver, args);
        tracing::debug!("bwrap {argv:?}");
        let st = Command::new("bwrap")
            .args(&argv)
            .cwd_dir(rootfs.try_clone()?)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out.try_clone()?))
            .status()
            .context("Spawning bwrap")?;
        if !st.success() {
            return Err(anyhow!("Failed to run dracut: {st:?}"));
        }
        out.seek(std::io::SeekFrom::Start(0))?;
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dracut_argv() {
        let argv = Dracut::argv("5.14.10-300.fc35.x86_64", &["-I".into(), "/etc/foo".into()]);
        let dracut = argv.iter().position(|a| a == "dracut").unwrap();
        assert_eq!(argv[dracut - 1], "--");
        assert_eq!(
            &argv[argv.len() - 4..],
            ["-I", "/etc/foo", "--kver", "5.14.10-300.fc35.x86_64"]
        );
        assert!(argv.iter().any(|a| a == "--stdout"));
    }
}
