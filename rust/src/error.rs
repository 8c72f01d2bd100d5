//! Error categories surfaced by the upgrader.
//!
//! Everything is carried as an [`anyhow::Error`]; the variants here are
//! attached at the point of failure so callers can classify a failure with
//! `err.downcast_ref::<UpgradeError>()` even after context has been added.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpgradeError {
    /// Bad or missing configuration: no OS name, an unconfigured origin.
    #[error("{0}")]
    Config(String),

    /// The sysroot is not in a state we can work from.
    #[error("{0}")]
    Consistency(String),

    /// The candidate base is older than the current one.
    #[error("{0}")]
    Regression(String),

    /// The package request contradicts the removal overrides or the base.
    #[error("{0}")]
    Conflict(String),

    /// The package backend could not satisfy the request.
    #[error("{0}")]
    Resolution(String),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl UpgradeError {
    pub(crate) fn config(msg: impl Into<String>) -> anyhow::Error {
        Self::Config(msg.into()).into()
    }

    pub(crate) fn consistency(msg: impl Into<String>) -> anyhow::Error {
        Self::Consistency(msg.into()).into()
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> anyhow::Error {
        Self::Conflict(msg.into()).into()
    }

    pub fn resolution(msg: impl Into<String>) -> anyhow::Error {
        Self::Resolution(msg.into()).into()
    }
}

/// Find the category of an error, looking through any added context.
pub fn classify(e: &anyhow::Error) -> Option<&UpgradeError> {
    e.chain().find_map(|e| e.downcast_ref::<UpgradeError>())
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_through_context() {
        let e: anyhow::Result<()> = Err(UpgradeError::conflict("oops"));
        let e = e.context("Finalizing packages").unwrap_err();
        assert_eq!(classify(&e), Some(&UpgradeError::Conflict("oops".into())));
        assert_eq!(format!("{e:#}"), "Finalizing packages: oops");
        let other = anyhow::anyhow!("plain");
        assert!(classify(&other).is_none());
    }
}
