/*
 * Copyright (C) 2018 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! Terminal progress for the individual upgrade steps, plus the sink
//! that remote fetches report into.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::Duration;

#[derive(PartialEq)]
enum ProgressType {
    Task,
    NItems(u64),
}

/// A wrapper around indicatif's ProgressBar with some extra state.
struct ProgressState {
    bar: ProgressBar,
    // In some cases we still want to print things even if stdout
    // isn't a tty; this helps us know that.
    is_hidden: bool,
    // indicatif doesn't expose an API to retrieve the message used,
    // but we want to print "Frobnicating...done".  So we keep around
    // the original message.  This `message` is really the `prefix`
    // in the format string.
    message: String,
}

// We only have one stdout, so we can really only print one progress
// bar at a time.
static PROGRESS: Lazy<Mutex<Option<ProgressState>>> = Lazy::new(|| Mutex::new(None));

impl ProgressState {
    fn new<M: Into<String>>(msg: M, ptype: ProgressType) -> Self {
        let msg = msg.into();
        let target = ProgressDrawTarget::stdout();
        let is_hidden = target.is_hidden();
        let pb = match ptype {
            ProgressType::Task => {
                let pb = ProgressBar::with_draw_target(None, target);
                if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {prefix} {msg}") {
                    pb.set_style(style);
                }
                pb.enable_steady_tick(Duration::from_millis(200));
                pb
            }
            ProgressType::NItems(n) => {
                let pb = ProgressBar::with_draw_target(Some(n), target);
                let width = n_digits(n);
                // Our width is static, so format the format string with it
                let fmt = format!(
                    "{{spinner}} {{prefix}} {{pos:>{width}}}/{{len:{width}}} [{{bar:20}}] {{msg}}"
                );
                if let Ok(style) = ProgressStyle::default_bar().template(&fmt) {
                    pb.set_style(style);
                }
                pb
            }
        };
        if is_hidden {
            print!("{msg}...");
        } else {
            let prefix = match ptype {
                ProgressType::Task => format!("{msg}..."),
                ProgressType::NItems(_) => msg.clone(),
            };
            pb.set_prefix(prefix);
        }
        Self {
            bar: pb,
            is_hidden,
            message: msg,
        }
    }

    fn update(&self, n: u64) {
        self.bar.set_position(n);
    }

    /// Clear the progress bar and print a completion message even on non-ttys.
    fn end(&self, suffix: Option<&str>) {
        self.bar.finish_and_clear();
        let suffix = suffix.unwrap_or("done");
        if self.is_hidden {
            println!("{suffix}");
        } else {
            println!("{}... {}", self.message, suffix);
        }
    }
}

/// Compute the maximum number of digits needed to represent an integer when
/// formatted as decimal.
fn n_digits(n: u64) -> u32 {
    let mut width = 1;
    let mut n = n;
    while n >= 10 {
        width += 1;
        n /= 10;
    }
    width
}

fn begin(msg: &str, ptype: ProgressType) {
    let mut lock = PROGRESS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(state) = lock.take() {
        // A previous task was abandoned (e.g. by a panic); close it out.
        state.end(Some("aborted"));
    }
    *lock = Some(ProgressState::new(msg, ptype));
}

fn end(suffix: Option<&str>) {
    let mut lock = PROGRESS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(state) = lock.take() {
        state.end(suffix);
    }
}

/// Run `f` while displaying a spinner with `msg`, ending with "done" or
/// "failed".
pub fn progress_task<F, T, E>(msg: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
{
    begin(msg, ProgressType::Task);
    let r = f();
    end(Some(if r.is_ok() { "done" } else { "failed" }));
    r
}

/// Like [`progress_task`], but for an operation over `n` items; `f` is
/// given a callback to report how many have been handled.
pub fn progress_n_items<F, T, E>(msg: &str, n: u64, f: F) -> Result<T, E>
where
    F: FnOnce(&dyn Fn(u64)) -> Result<T, E>,
{
    begin(msg, ProgressType::NItems(n));
    let update = |i: u64| {
        let lock = PROGRESS.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = lock.as_ref() {
            state.update(i);
        }
    };
    let r = f(&update);
    end(Some(if r.is_ok() { "done" } else { "failed" }));
    r
}

/// Receives progress from a remote fetch.
pub trait ProgressSink {
    /// A human readable status line.
    fn message(&self, msg: &str);
    /// Called once the fetch has completed, successfully or not.
    fn finish(&self);
}

/// A [`ProgressSink`] which just logs.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn message(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    fn finish(&self) {
        tracing::debug!("fetch complete");
    }
}
