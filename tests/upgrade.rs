// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use rpmostree_upgrader::error::{classify, UpgradeError};
use rpmostree_upgrader::origin::Origin;
use rpmostree_upgrader::progress::LogProgress;
use rpmostree_upgrader::store::{
    PullFlags, Repo, Sysroot, CLIENTLAYER_KEY, PACKAGES_KEY, REMOVED_BASE_PACKAGES_KEY,
    SEPOLICY_KEY, TMP_BASE_REF,
};
use rpmostree_upgrader::syscore;
use rpmostree_upgrader::sysroot_upgrade::UpgraderFlags;
use rpmostree_upgrader::testutils::{
    import_local_package, pkg, FakeInitramfs, Fixture, KVER, RPMDB_JSON,
};
use rpmostree_upgrader::utils::Cancellable;

fn deployment_origin(d: &rpmostree_upgrader::store::Deployment) -> Result<Origin> {
    Origin::new_from_str(d.origin.as_deref().unwrap())
}

#[test]
fn noop_pull() -> Result<()> {
    let fx = Fixture::new(&["foo-1.0-1.x86_64"])?;
    let c = Cancellable::new();
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    assert_eq!(u.osname(), "fedora");
    assert_eq!(u.base(), fx.base);
    assert_eq!(u.final_revision(), None);
    assert!(!u.pull(None, PullFlags::empty(), Some(&LogProgress), &c)?);
    assert!(!u.pull(None, PullFlags::empty(), None, &c)?);
    assert_eq!(u.base(), fx.base);
    assert_eq!(fx.repo().pulls().len(), 2);
    Ok(())
}

#[test]
fn plain_upgrade() -> Result<()> {
    let fx = Fixture::new(&["foo-1.0-1.x86_64"])?;
    let booted = fx.sysroot.booted_deployment().unwrap();
    let writes = fx.sysroot.write_count();
    let rev = fx.publish_update(&["foo-1.1-1.x86_64"], "35.20211002.0", None)?;
    let c = Cancellable::new();
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    assert!(u.pull(None, PullFlags::empty(), None, &c)?);
    assert_eq!(u.base(), rev);
    let d = u.deploy(&c)?.unwrap();
    assert_eq!(d.csum, rev);
    assert_eq!(fx.sysroot.write_count(), writes + 1);
    let deployments = fx.sysroot.deployments();
    assert_eq!(deployments.len(), 2);
    assert!(deployments[0].equal(&d));
    assert!(deployments[1].equal(&booted));
    // Nothing is layered, so nothing needs protecting
    assert!(fx.repo().list_refs("rpmostree/base/")?.is_empty());
    assert!(!fx.backend.events().iter().any(|e| e == "prepare"));
    Ok(())
}

#[test]
fn downgrade_guard() -> Result<()> {
    let fx = Fixture::new(&["foo-1.0-1.x86_64"])?;
    let older = fx.publish_update(&["foo-0.9-1.x86_64"], "34.1", Some(1_500_000_000))?;
    let c = Cancellable::new();
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let e = u.pull(None, PullFlags::empty(), None, &c).unwrap_err();
    assert!(matches!(classify(&e), Some(UpgradeError::Regression(_))));
    assert!(format!("{e:#}").contains("is chronologically older than current revision"));
    assert_eq!(u.base(), fx.base);

    let mut u = fx.upgrader(UpgraderFlags::ALLOW_OLDER)?;
    assert!(u.pull(None, PullFlags::empty(), None, &c)?);
    assert_eq!(u.base(), older);
    Ok(())
}

#[test]
fn layering() -> Result<()> {
    let fx = Fixture::new_with_origin(&["foo-1.0-1.x86_64"], "[packages]\nrequested=bar;foo;\n")?;
    fx.backend.add_available(pkg("bar-2.0-1.x86_64"));
    let c = Cancellable::new();
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let d = u.deploy(&c)?.unwrap();
    // foo is already in the base
    assert_eq!(u.overlay_packages(), ["bar"]);
    let layered = u.final_revision().unwrap().to_string();
    assert_eq!(d.csum, layered);

    let repo = fx.repo();
    let commit = repo.load_commit(&layered)?;
    assert_eq!(commit.parent.as_deref(), Some(fx.base.as_str()));
    assert_eq!(commit.metadata[CLIENTLAYER_KEY], serde_json::json!(true));
    assert_eq!(commit.metadata[PACKAGES_KEY], serde_json::json!(["bar"]));
    assert_eq!(
        commit.metadata[REMOVED_BASE_PACKAGES_KEY],
        serde_json::json!([])
    );
    assert!(commit.metadata.contains_key(SEPOLICY_KEY));
    assert_eq!(commit.version(), Some("35.20211001.0"));
    let info = syscore::commit_get_layered_info(repo, &layered)?;
    assert!(info.is_layered);
    assert_eq!(info.base_commit.as_deref(), Some(fx.base.as_str()));

    assert_eq!(
        repo.read_file(&layered, "usr/bin/bar")?.unwrap(),
        b"bar-2.0-1.x86_64\n"
    );
    let rpmdb = String::from_utf8(repo.read_file(&layered, RPMDB_JSON)?.unwrap())?;
    assert!(rpmdb.contains("\"bar\""));
    // Configuration ends up back in /usr/etc
    assert!(repo
        .read_file(&layered, "usr/etc/yum.repos.d/fedora.repo")?
        .is_some());
    assert!(!repo.list_paths(&layered)?.iter().any(|p| p.starts_with("etc")));
    // Unmodified base files were not rehashed
    assert!(repo.devino_hits() > 0);

    similar_asserts::assert_eq!(
        fx.backend.events(),
        [
            "new-context sepolicy=targeted",
            "prepare",
            "download",
            "import",
            "relabel",
            "assemble noscripts=false",
        ]
    );

    // The base of the new deployment is protected, the temporary ref is gone
    let refs = repo.refs();
    assert_eq!(refs.get("rpmostree/base/0"), Some(&fx.base));
    assert!(!refs.contains_key(TMP_BASE_REF));

    // A second upgrader stacks on the pending deployment
    let u2 = fx.upgrader(UpgraderFlags::empty())?;
    assert!(u2.origin_merge_deployment().equal(&d));
    assert_eq!(u2.base(), fx.base);
    assert_eq!(u2.final_revision(), Some(layered.as_str()));
    assert!(u2.origin().packages().contains("bar"));
    Ok(())
}

#[test]
fn noscripts() -> Result<()> {
    let fx = Fixture::new_with_origin(&[], "[packages]\nrequested=bar;\n")?;
    fx.backend.add_available(pkg("bar-2.0-1.x86_64"));
    let mut u = fx.upgrader(UpgraderFlags::PKGOVERLAY_NOSCRIPTS)?;
    u.deploy(&Cancellable::new())?.unwrap();
    assert!(fx
        .backend
        .events()
        .contains(&"assemble noscripts=true".to_string()));
    Ok(())
}

#[test]
fn unresolvable() -> Result<()> {
    let fx = Fixture::new_with_origin(&["foo-1.0-1.x86_64"], "[packages]\nrequested=nope;\n")?;
    let writes = fx.sysroot.write_count();
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let e = u.deploy(&Cancellable::new()).unwrap_err();
    assert!(matches!(classify(&e), Some(UpgradeError::Resolution(_))));
    assert_eq!(fx.sysroot.write_count(), writes);
    Ok(())
}

#[test]
fn stale_removal_overrides() -> Result<()> {
    let fx = Fixture::new_with_origin(&["foo-1.0-1.x86_64"], "[overrides]\nremove=gone;\n")?;
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let d = u.deploy(&Cancellable::new())?.unwrap();
    // Nothing left to layer
    assert_eq!(d.csum, fx.base);
    assert_eq!(u.final_revision(), None);
    let origin = deployment_origin(&d)?;
    assert!(origin.override_remove().is_empty());
    assert!(!origin.may_require_local_assembly());
    Ok(())
}

#[test]
fn removal_override() -> Result<()> {
    let fx = Fixture::new_with_origin(
        &["foo-1.0-1.x86_64", "bar-1.0-1.x86_64"],
        "[overrides]\nremove=bar;\n",
    )?;
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    u.deploy(&Cancellable::new())?.unwrap();
    let layered = u.final_revision().unwrap().to_string();
    let repo = fx.repo();
    assert!(repo.read_file(&layered, "usr/bin/bar")?.is_none());
    assert!(repo.read_file(&layered, "usr/bin/foo")?.is_some());
    let commit = repo.load_commit(&layered)?;
    assert_eq!(
        commit.metadata[REMOVED_BASE_PACKAGES_KEY],
        serde_json::json!(["bar-1.0-1.x86_64"])
    );
    Ok(())
}

#[test]
fn request_provided_by_removed_package() -> Result<()> {
    let fx = Fixture::new_with_origin(
        &["bar-2.0-1.x86_64"],
        "[packages]\nrequested=bar;\n[overrides]\nremove=bar;\n",
    )?;
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let e = u.deploy(&Cancellable::new()).unwrap_err();
    assert_eq!(
        classify(&e),
        Some(&UpgradeError::Conflict(
            "Cannot request 'bar' provided by removed package 'bar-2.0-1.x86_64'".into()
        ))
    );
    assert!(fx.backend.events().is_empty());
    Ok(())
}

#[test]
fn local_packages() -> Result<()> {
    let fx = Fixture::new(&["foo-1.0-1.x86_64"])?;
    let c = Cancellable::new();
    let pkgcache = fx.sysroot.memory_pkgcache();

    // Already in the base: rejected before anything is downloaded
    let dup = import_local_package(pkgcache, &pkg("foo-1.0-1.x86_64"))?;
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let mut origin = u.dup_origin();
    origin.add_packages(&[dup.as_str()], true)?;
    u.set_origin(origin);
    let e = u.deploy(&c).unwrap_err();
    assert_eq!(
        classify(&e),
        Some(&UpgradeError::Conflict(
            "Package 'foo-1.0-1.x86_64' is already in the base".into()
        ))
    );
    assert!(!fx.backend.events().iter().any(|e| e == "download"));

    let baz = import_local_package(pkgcache, &pkg("baz-1.0-1.x86_64"))?;
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let mut origin = u.dup_origin();
    origin.add_packages(&[baz.as_str()], true)?;
    u.set_origin(origin);
    let d = u.deploy(&c)?.unwrap();
    let repo = fx.repo();
    assert_eq!(
        repo.read_file(&d.csum, "usr/bin/baz")?.unwrap(),
        b"baz-1.0-1.x86_64\n"
    );
    let commit = repo.load_commit(&d.csum)?;
    assert_eq!(
        commit.metadata[PACKAGES_KEY],
        serde_json::json!(["baz-1.0-1.x86_64"])
    );
    assert_eq!(
        deployment_origin(&d)?.local_packages().keys().collect::<Vec<_>>(),
        ["baz-1.0-1.x86_64"]
    );
    Ok(())
}

#[test]
fn dry_run() -> Result<()> {
    let fx = Fixture::new_with_origin(&["foo-1.0-1.x86_64"], "[packages]\nrequested=bar;\n")?;
    fx.backend.add_available(pkg("bar-2.0-1.x86_64"));
    let commits = fx.repo().commit_count();
    let writes = fx.sysroot.write_count();
    let refs = fx.repo().refs();
    let mut u = fx.upgrader(UpgraderFlags::DRY_RUN)?;
    assert!(u.deploy(&Cancellable::new())?.is_none());
    assert_eq!(u.final_revision(), None);
    let summary = u.transaction_summary().unwrap();
    assert_eq!(summary.install, ["bar-2.0-1.x86_64"]);
    assert_eq!(fx.repo().commit_count(), commits);
    assert_eq!(fx.sysroot.write_count(), writes);
    similar_asserts::assert_eq!(fx.repo().refs(), refs);
    assert!(!fx.backend.events().iter().any(|e| e == "download"));
    Ok(())
}

#[test]
fn unchanged_origin_is_idempotent() -> Result<()> {
    let fx = Fixture::new(&["foo-1.0-1.x86_64"])?;
    let c = Cancellable::new();
    let commits = fx.repo().commit_count();
    for _ in 0..2 {
        let mut u = fx.upgrader(UpgraderFlags::empty())?;
        let d = u.deploy(&c)?.unwrap();
        assert_eq!(d.csum, fx.base);
        assert_eq!(u.final_revision(), None);
        assert_eq!(fx.sysroot.deployments()[0].csum, fx.base);
        assert_eq!(fx.repo().commit_count(), commits);
    }
    assert!(fx.repo().list_refs("rpmostree/base/")?.is_empty());

    let writes = fx.sysroot.write_count();
    let deployments = fx.sysroot.deployments();
    for _ in 0..2 {
        let mut u = fx.upgrader(UpgraderFlags::DRY_RUN)?;
        assert!(u.deploy(&c)?.is_none());
        // No package work, so nothing to report
        assert!(u.transaction_summary().is_none());
        assert_eq!(fx.sysroot.write_count(), writes);
        assert_eq!(fx.sysroot.deployments(), deployments);
        assert_eq!(fx.repo().commit_count(), commits);
    }
    Ok(())
}

#[test]
fn initramfs_regeneration() -> Result<()> {
    let fx = Fixture::new_with_origin(
        &["foo-1.0-1.x86_64"],
        "[rpmostree]\nregenerate-initramfs=true\ninitramfs-args=-I;/etc/foo;\n",
    )?;
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let d = u.deploy(&Cancellable::new())?.unwrap();
    assert_eq!(fx.initramfs.calls(), 1);
    assert_eq!(fx.backend.events()[1], "set-is-empty");
    let img = fx
        .repo()
        .read_file(&d.csum, &format!("usr/lib/modules/{KVER}/initramfs.img"))?
        .unwrap();
    assert_eq!(
        String::from_utf8(img)?,
        FakeInitramfs::contents(KVER, &["-I".into(), "/etc/foo".into()])
    );
    Ok(())
}

#[test]
fn cancellation() -> Result<()> {
    let fx = Fixture::new_with_origin(&["foo-1.0-1.x86_64"], "[packages]\nrequested=bar;\n")?;
    fx.backend.add_available(pkg("bar-2.0-1.x86_64"));
    let writes = fx.sysroot.write_count();
    let c = Cancellable::new();
    c.cancel();
    let mut u = fx.upgrader(UpgraderFlags::empty())?;
    let e = u.pull(None, PullFlags::empty(), None, &c).unwrap_err();
    assert_eq!(classify(&e), Some(&UpgradeError::Cancelled));
    let e = u.deploy(&c).unwrap_err();
    assert_eq!(classify(&e), Some(&UpgradeError::Cancelled));
    assert_eq!(fx.sysroot.write_count(), writes);
    Ok(())
}

#[test]
fn init_errors() -> Result<()> {
    let fx = Fixture::new_with_origin(&[], "")?;
    let opts = |osname: Option<&str>| rpmostree_upgrader::sysroot_upgrade::UpgraderOpts {
        backends: fx.backends(),
        osname: osname.map(String::from),
        flags: UpgraderFlags::empty(),
    };
    let new = rpmostree_upgrader::sysroot_upgrade::SysrootUpgrader::new;
    let e = new(opts(Some(""))).err().unwrap();
    assert!(matches!(classify(&e), Some(UpgradeError::Config(_))));
    let e = new(opts(Some("rhcos"))).err().unwrap();
    assert_eq!(
        classify(&e),
        Some(&UpgradeError::Consistency(
            "No previous deployment for OS 'rhcos'".into()
        ))
    );
    fx.sysroot.set_booted(None);
    let e = new(opts(None)).err().unwrap();
    assert!(matches!(classify(&e), Some(UpgradeError::Config(_))));
    assert!(new(opts(Some("fedora"))).is_ok());

    let fx = Fixture::new_with_origin(&[], "unconfigured-state=Register first\n")?;
    let e = fx.upgrader(UpgraderFlags::empty()).err().unwrap();
    assert_eq!(
        classify(&e),
        Some(&UpgradeError::Config(
            "origin unconfigured-state: Register first".into()
        ))
    );
    assert!(fx.upgrader(UpgraderFlags::IGNORE_UNCONFIGURED).is_ok());
    Ok(())
}
