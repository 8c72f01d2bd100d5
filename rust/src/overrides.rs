//! Command line front end for base package overrides and initramfs
//! regeneration.  Parsing produces a [`TransactionRequest`]; executing it
//! is up to whoever owns the sysroot.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::transaction::{DeployOptions, DeployRequest, InitramfsStateRequest, TransactionRequest};
use anyhow::{bail, Result};
use clap::Parser;

#[derive(Debug, Parser)]
#[clap(name = "rpmostree-upgrader", rename_all = "kebab-case")]
/// Manage package overrides and initramfs regeneration
pub struct Cli {
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, clap::Args)]
#[clap(rename_all = "kebab-case")]
struct CommonOpts {
    /// Operate on provided OSNAME
    #[clap(long = "os", value_name = "OSNAME")]
    osname: Option<String>,

    /// Initiate a reboot after operation is complete
    #[clap(long, short = 'r')]
    reboot: bool,
}

/// Package layering changes made in the same transaction as an override.
#[derive(Debug, clap::Args)]
#[clap(rename_all = "kebab-case")]
struct PkgOpts {
    /// Overlay additional package
    #[clap(long, value_name = "PKG")]
    install: Vec<String>,

    /// Remove overlayed additional package
    #[clap(long, value_name = "PKG")]
    uninstall: Vec<String>,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Cmd {
    /// Manage base package overrides
    Override {
        #[clap(subcommand)]
        cmd: OverrideCmd,
    },
    /// Enable or disable local initramfs regeneration
    Initramfs {
        #[clap(flatten)]
        common: CommonOpts,

        /// Enable regenerating initramfs locally
        #[clap(long, conflicts_with = "disable", required_unless_present = "disable")]
        enable: bool,

        /// Disable regenerating initramfs locally
        #[clap(long)]
        disable: bool,

        /// Append ARG to the dracut arguments
        #[clap(long = "arg", value_name = "ARG", requires = "enable")]
        args: Vec<String>,
    },
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum OverrideCmd {
    /// Remove packages from the base layer
    Remove {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        pkgs: PkgOpts,

        /// Exit after printing the transaction
        #[clap(long, short = 'n')]
        dry_run: bool,

        packages: Vec<String>,
    },
    /// Replace packages in the base layer
    Replace {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        pkgs: PkgOpts,

        #[clap(long, short = 'n')]
        dry_run: bool,

        packages: Vec<String>,
    },
    /// Reset currently active package overrides
    Reset {
        #[clap(flatten)]
        common: CommonOpts,

        #[clap(flatten)]
        pkgs: PkgOpts,

        #[clap(long, short = 'n')]
        dry_run: bool,

        /// Reset all active overrides
        #[clap(long, short = 'a')]
        all: bool,

        packages: Vec<String>,
    },
}

fn override_request(
    common: CommonOpts,
    pkgs: PkgOpts,
    dry_run: bool,
    f: impl FnOnce(&mut DeployRequest),
) -> TransactionRequest {
    let mut req = DeployRequest {
        osname: common.osname,
        install_packages: pkgs.install,
        uninstall_packages: pkgs.uninstall,
        options: DeployOptions {
            reboot_after: common.reboot,
            // Overrides apply to the current base
            no_pull_base: true,
            dry_run,
            ..Default::default()
        },
        ..Default::default()
    };
    f(&mut req);
    TransactionRequest::Deploy(req)
}

fn require_packages(packages: &[String]) -> Result<()> {
    if packages.is_empty() {
        bail!("At least one PACKAGE must be specified");
    }
    Ok(())
}

impl OverrideCmd {
    fn into_request(self) -> Result<TransactionRequest> {
        let r = match self {
            OverrideCmd::Remove {
                common,
                pkgs,
                dry_run,
                packages,
            } => {
                require_packages(&packages)?;
                override_request(common, pkgs, dry_run, |r| r.override_remove = packages)
            }
            OverrideCmd::Replace {
                common,
                pkgs,
                dry_run,
                packages,
            } => {
                require_packages(&packages)?;
                override_request(common, pkgs, dry_run, |r| r.override_replace = packages)
            }
            OverrideCmd::Reset {
                common,
                pkgs,
                dry_run,
                all,
                packages,
            } => {
                if all {
                    if !packages.is_empty() {
                        bail!("Cannot specify PACKAGEs with --all");
                    }
                } else {
                    require_packages(&packages)?;
                }
                override_request(common, pkgs, dry_run, |r| {
                    r.options.reset_all = all;
                    r.override_reset = packages;
                })
            }
        };
        Ok(r)
    }
}

impl Cli {
    /// Validate the arguments and build the request they describe.
    pub fn into_request(self) -> Result<TransactionRequest> {
        match self.cmd {
            Cmd::Override { cmd } => cmd.into_request(),
            Cmd::Initramfs {
                common,
                enable,
                disable: _,
                args,
            } => Ok(TransactionRequest::InitramfsState(InitramfsStateRequest {
                osname: common.osname,
                regenerate: enable,
                args,
                reboot: common.reboot,
            })),
        }
    }
}

/// Parse `argv` (including the program name) into a request.
pub fn parse_request<I, S>(argv: I) -> Result<TransactionRequest>
where
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(argv)?.into_request()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn override_remove() -> Result<()> {
        let r = parse_request(["x", "override", "remove", "foo", "bar", "--os=fedora", "-r"])?;
        let TransactionRequest::Deploy(d) = r else {
            panic!("expected deploy request");
        };
        assert_eq!(d.override_remove, ["foo", "bar"]);
        assert_eq!(d.osname.as_deref(), Some("fedora"));
        assert!(d.options.reboot_after);
        assert!(d.options.no_pull_base);
        assert!(!d.options.dry_run);

        let e = parse_request(["x", "override", "remove"]).unwrap_err();
        assert_eq!(e.to_string(), "At least one PACKAGE must be specified");
        Ok(())
    }

    #[test]
    fn override_reset() -> Result<()> {
        let TransactionRequest::Deploy(d) = parse_request(["x", "override", "reset", "--all"])?
        else {
            panic!("expected deploy request");
        };
        assert!(d.options.reset_all);
        assert!(d.override_reset.is_empty());
        d.validate()?;

        let e = parse_request(["x", "override", "reset", "--all", "foo"]).unwrap_err();
        assert_eq!(e.to_string(), "Cannot specify PACKAGEs with --all");
        let e = parse_request(["x", "override", "reset"]).unwrap_err();
        assert_eq!(e.to_string(), "At least one PACKAGE must be specified");
        Ok(())
    }

    #[test]
    fn override_replace() -> Result<()> {
        let TransactionRequest::Deploy(d) =
            parse_request(["x", "override", "replace", "/tmp/foo-2.0-1.x86_64.rpm", "bar"])?
        else {
            panic!("expected deploy request");
        };
        // Files are replacements too, never layered installs
        assert_eq!(d.override_replace, ["/tmp/foo-2.0-1.x86_64.rpm", "bar"]);
        assert!(d.install_local_packages.is_empty());
        assert!(d.install_packages.is_empty());
        assert_eq!(
            d.validate().unwrap_err().to_string(),
            "Non-local replacement overrides not implemented yet"
        );
        Ok(())
    }

    #[test]
    fn layering_alongside_overrides() -> Result<()> {
        let TransactionRequest::Deploy(d) = parse_request([
            "x",
            "override",
            "remove",
            "nano",
            "--install=vim-enhanced",
            "--install",
            "tmux",
            "--uninstall=emacs",
        ])?
        else {
            panic!("expected deploy request");
        };
        assert_eq!(d.override_remove, ["nano"]);
        assert_eq!(d.install_packages, ["vim-enhanced", "tmux"]);
        assert_eq!(d.uninstall_packages, ["emacs"]);
        d.validate()?;

        let TransactionRequest::Deploy(d) =
            parse_request(["x", "override", "reset", "--all", "--uninstall=emacs"])?
        else {
            panic!("expected deploy request");
        };
        assert!(d.options.reset_all);
        assert_eq!(d.uninstall_packages, ["emacs"]);

        let TransactionRequest::Deploy(d) =
            parse_request(["x", "override", "replace", "foo", "--install=bar"])?
        else {
            panic!("expected deploy request");
        };
        assert_eq!(d.install_packages, ["bar"]);
        Ok(())
    }

    #[test]
    fn initramfs() -> Result<()> {
        let r = parse_request(["x", "initramfs", "--enable", "--arg=-I", "--arg=/etc/foo"])?;
        assert_eq!(
            r,
            TransactionRequest::InitramfsState(InitramfsStateRequest {
                osname: None,
                regenerate: true,
                args: vec!["-I".into(), "/etc/foo".into()],
                reboot: false,
            })
        );
        let r = parse_request(["x", "initramfs", "--disable"])?;
        let TransactionRequest::InitramfsState(i) = r else {
            panic!("expected initramfs request");
        };
        assert!(!i.regenerate);
        assert!(parse_request(["x", "initramfs"]).is_err());
        assert!(parse_request(["x", "initramfs", "--enable", "--disable"]).is_err());
        assert!(parse_request(["x", "initramfs", "--disable", "--arg=foo"]).is_err());
        Ok(())
    }

    #[test]
    fn request_json() -> Result<()> {
        let r = parse_request(["x", "override", "remove", "foo"])?;
        let v = serde_json::to_value(&r)?;
        assert_eq!(v["transaction"], "deploy");
        assert_eq!(v["override-remove"][0], "foo");
        assert_eq!(v["options"]["no-pull-base"], true);
        let back: TransactionRequest = serde_json::from_value(v)?;
        similar_asserts::assert_eq!(back, r);
        Ok(())
    }
}
