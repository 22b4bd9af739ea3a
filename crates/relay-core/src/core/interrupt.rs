//! Ctrl+C wiring for interactive front ends.
//!
//! The first press marks an interrupt as pending and wakes waiters, which
//! stop the in-flight reply. A second press before the pending interrupt is
//! acknowledged exits the process with status 130.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::Notify;

/// Exit status used for an interrupted process (128 + SIGINT).
pub const EXIT_INTERRUPTED: i32 = 130;

static PENDING: AtomicBool = AtomicBool::new(false);
static WAKE: OnceLock<Notify> = OnceLock::new();

fn wake() -> &'static Notify {
    WAKE.get_or_init(Notify::new)
}

#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

/// Registers the process Ctrl+C handler. The handler never prints.
pub fn install() -> Result<()> {
    ctrlc::set_handler(on_ctrl_c).context("Failed to register Ctrl+C handler")
}

fn on_ctrl_c() {
    if PENDING.swap(true, Ordering::SeqCst) {
        std::process::exit(EXIT_INTERRUPTED);
    }
    wake().notify_waiters();
}

/// Whether a Ctrl+C arrived that nobody acknowledged yet.
pub fn is_pending() -> bool {
    PENDING.load(Ordering::SeqCst)
}

/// Resolves once an interrupt is pending.
pub async fn wait() {
    loop {
        let notified = wake().notified();
        if is_pending() {
            return;
        }
        notified.await;
    }
}

/// Clears the pending interrupt so the next press is a "first" press again.
pub fn acknowledge() {
    PENDING.store(false, Ordering::SeqCst);
}

#[cfg(test)]
pub(crate) fn simulate_press() {
    on_ctrl_c();
}
