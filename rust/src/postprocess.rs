//! Fixups applied to an assembled tree before it is committed.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{bail, Result};
use cap_std::fs::Dir;
use fn_error_context::context;

/// OSTree keeps default configuration in `/usr/etc`; package scripts may
/// have left a toplevel `/etc` behind, which we move into place.
#[context("Postprocessing rootfs")]
pub fn rootfs_postprocess_common(rootfs: &Dir) -> Result<()> {
    let has_etc = rootfs.try_exists("etc")?;
    let has_usretc = rootfs.try_exists("usr/etc")?;
    match (has_etc, has_usretc) {
        (true, true) => bail!("Found both /etc and /usr/etc"),
        (true, false) => {
            tracing::debug!("Renaming etc to usr/etc");
            rootfs.create_dir_all("usr")?;
            rootfs.rename("etc", rootfs, "usr/etc")?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use cap_std_ext::cap_tempfile;

    #[test]
    fn etc_handling() -> Result<()> {
        let d = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        // The no-op case
        rootfs_postprocess_common(&d)?;
        d.create_dir("etc")?;
        d.write("etc/foo.conf", "x")?;
        rootfs_postprocess_common(&d)?;
        assert!(!d.try_exists("etc")?);
        assert_eq!(d.read_to_string("usr/etc/foo.conf")?, "x");
        // Already in place
        rootfs_postprocess_common(&d)?;
        d.create_dir("etc")?;
        assert!(rootfs_postprocess_common(&d).is_err());
        Ok(())
    }
}
