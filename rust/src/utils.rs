//! Small helpers shared across the crate: refspecs, checksums and
//! cooperative cancellation.

/*
 * Copyright (C) 2018 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use crate::error::UpgradeError;
use anyhow::{anyhow, bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Length of a hex SHA-256 string.
pub const SHA256_HEXLEN: usize = 64;

// Same grammar ostree uses: an optional remote, then a ref.
static REFSPEC_RE: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| {
    Regex::new(r"^(?:([\w\d][-._\w\d]*):)?((?:[\w\d][-._\w\d]*)(?:/[\w\d][-._\w\d]*)*)$")
});

/// A cooperative cancellation token shared between the caller and a
/// running operation.
#[derive(Debug, Clone, Default)]
pub struct Cancellable(Arc<AtomicBool>);

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return an error if cancellation was requested.
    pub fn set_error_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(UpgradeError::Cancelled.into());
        }
        Ok(())
    }
}

/// Split a refspec like `remote:some/branch` into its parts.
pub fn parse_refspec(refspec: &str) -> Result<(Option<String>, String)> {
    let re = REFSPEC_RE.as_ref().map_err(|e| anyhow!("Compiling refspec regex: {e}"))?;
    let caps = re
        .captures(refspec)
        .ok_or_else(|| anyhow!("Invalid refspec {refspec}"))?;
    let remote = caps.get(1).map(|m| m.as_str().to_string());
    // Group 2 always participates in a match
    let r = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    Ok((remote, r.to_string()))
}

/// Format a remote and ref back into a refspec.
pub fn format_refspec(remote: Option<&str>, r: &str) -> String {
    match remote {
        Some(remote) => format!("{remote}:{r}"),
        None => r.to_string(),
    }
}

pub fn is_checksum(s: &str) -> bool {
    s.len() == SHA256_HEXLEN
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn validate_checksum_string(s: &str) -> Result<()> {
    if !is_checksum(s) {
        bail!("Invalid checksum '{s}'");
    }
    Ok(())
}

/// The short form of a checksum used in messages.
pub fn shorten_checksum(s: &str) -> &str {
    s.get(..7).unwrap_or(s)
}

/// Given a string of the form `sha256:NEVRA`, return the pair.
pub fn decompose_sha256_nevra(v: &str) -> Result<(&str, &str)> {
    let parts = v.split_once(':');
    match parts {
        Some((sha256, nevra)) if is_checksum(sha256) && !nevra.is_empty() => Ok((nevra, sha256)),
        _ => bail!("Invalid SHA-256 NEVRA string: {v}"),
    }
}

/// The inverse of [`decompose_sha256_nevra`].
pub fn compose_sha256_nevra(nevra: &str, sha256: &str) -> String {
    format!("{sha256}:{nevra}")
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(data))
}
