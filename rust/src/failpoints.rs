//! Wrappers and utilities on top of the `fail` crate.
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Return early with an error if the named failpoint is active.
///
/// TODO: Use https://github.com/tikv/fail-rs/pull/68 once it merges
#[macro_export]
macro_rules! try_fail_point {
    ($name:expr) => {{
        if let Some(e) = fail::eval($name, |msg| {
            let msg = msg.unwrap_or_else(|| format!("failpoint {}", $name));
            anyhow::Error::msg(msg)
        }) {
            return Err(From::from(e));
        }
    }};
    ($name:expr, $cond:expr) => {{
        if $cond {
            $crate::try_fail_point!($name);
        }
    }};
}

/// Failpoint hit after the new deployment has been created but before the
/// deployment list is written.
pub const DEPLOY_BEFORE_WRITE: &str = "upgrader::deploy-before-write";

/// Failpoint hit right after the layered commit has been written.
pub const ASSEMBLY_AFTER_COMMIT: &str = "upgrader::assembly-after-commit";
