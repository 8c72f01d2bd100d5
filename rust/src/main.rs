//! The main CLI logic.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use std::io::Write;
use termcolor::WriteColor;

/// The real main function returns a `Result<>`.
fn inner_main() -> Result<i32> {
    // Initialize failpoints
    let _scenario = fail::FailScenario::setup();
    fail::fail_point!("main");
    // Requests are written to stdout, so log to stderr.
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    tracing::trace!("starting");
    let req = rpmostree_upgrader::overrides::parse_request(std::env::args_os())?;
    if let rpmostree_upgrader::transaction::TransactionRequest::Deploy(d) = &req {
        d.validate()?;
    }
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    serde_json::to_writer_pretty(&mut stdout, &req)?;
    writeln!(stdout)?;
    Ok(0)
}

fn print_error(e: anyhow::Error) {
    let msg = format!("{:#}", e);
    // Print the error: prefix in red if we're on a tty
    let stderr = termcolor::BufferWriter::stderr(termcolor::ColorChoice::Auto);
    let stderrbuf = {
        let mut stderrbuf = stderr.buffer();
        let _ =
            stderrbuf.set_color(termcolor::ColorSpec::new().set_fg(Some(termcolor::Color::Red)));
        let _ = write!(&mut stderrbuf, "error: ");
        let _ = stderrbuf.reset();
        let _ = writeln!(&mut stderrbuf, "{}", msg);
        stderrbuf
    };
    let _ = stderr.print(&stderrbuf);
}

fn main() {
    match inner_main() {
        Ok(e) => std::process::exit(e),
        Err(e) => {
            // Let clap render its own help and usage errors
            if let Some(e) = e.downcast_ref::<clap::Error>() {
                e.exit()
            }
            print_error(e);
            std::process::exit(1)
        }
    }
}
