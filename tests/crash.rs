// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interrupted upgrades.  Failpoints are process global, so everything
//! lives in one test.

use anyhow::Result;
use rpmostree_upgrader::failpoints::{ASSEMBLY_AFTER_COMMIT, DEPLOY_BEFORE_WRITE};
use rpmostree_upgrader::store::{Repo, Sysroot, TMP_BASE_REF};
use rpmostree_upgrader::sysroot_upgrade::UpgraderFlags;
use rpmostree_upgrader::testutils::{pkg, Fixture};
use rpmostree_upgrader::utils::Cancellable;

#[test]
fn interrupted_deploys() -> Result<()> {
    let scenario = fail::FailScenario::setup();
    let fx = Fixture::new_with_origin(&["foo-1.0-1.x86_64"], "[packages]\nrequested=bar;\n")?;
    fx.backend.add_available(pkg("bar-2.0-1.x86_64"));
    let c = Cancellable::new();
    let before = fx.sysroot.deployments();
    let writes = fx.sysroot.write_count();

    // Crash after the layered commit is written
    fail::cfg(ASSEMBLY_AFTER_COMMIT, "return").map_err(anyhow::Error::msg)?;
    let commits = fx.repo().commit_count();
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    assert!(u.deploy(&c).is_err());
    assert_eq!(fx.repo().commit_count(), commits + 1);
    assert_eq!(fx.sysroot.deployments(), before);
    assert_eq!(fx.sysroot.write_count(), writes);
    fail::remove(ASSEMBLY_AFTER_COMMIT);

    // Crash after the deployment is created but before it is published
    fail::cfg(DEPLOY_BEFORE_WRITE, "return").map_err(anyhow::Error::msg)?;
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let e = u.deploy(&c).unwrap_err();
    assert!(format!("{e:#}").contains(DEPLOY_BEFORE_WRITE));
    assert_eq!(fx.sysroot.deployments(), before);
    assert_eq!(fx.sysroot.write_count(), writes);
    // The base of the orphaned layered commit is still protected
    assert_eq!(
        fx.repo().resolve_rev(TMP_BASE_REF, false)?.as_deref(),
        Some(fx.base.as_str())
    );
    fail::remove(DEPLOY_BEFORE_WRITE);

    // The next attempt starts over from a clean scratch checkout
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let d = u.deploy(&c)?.unwrap();
    let deployments = fx.sysroot.deployments();
    assert_eq!(deployments.len(), before.len() + 1);
    assert!(deployments[0].equal(&d));
    assert!(fx.repo().resolve_rev(TMP_BASE_REF, true)?.is_none());
    assert_eq!(
        fx.repo().resolve_rev("rpmostree/base/0", false)?.as_deref(),
        Some(fx.base.as_str())
    );
    scenario.teardown();
    Ok(())
}
