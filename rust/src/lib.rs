/*
 * Copyright (C) 2018 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! Compute, assemble and atomically publish package-layered OSTree
//! deployments.
//!
//! The entry point is [`sysroot_upgrade::SysrootUpgrader`]; the
//! [`transaction`] module drives it from front end requests.

pub mod context;
pub mod error;
pub mod failpoints;
pub mod initramfs;
pub mod kernel;
pub mod origin;
pub mod overrides;
pub mod pkgcache;
pub mod postprocess;
pub mod progress;
pub mod rpmutils;
pub mod sepolicy;
pub mod store;
pub mod syscore;
pub mod sysroot_upgrade;
pub mod testutils;
pub mod transaction;
pub mod treespec;
pub mod utils;

pub use error::UpgradeError;
