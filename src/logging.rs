//! Tracing setup for binaries and tests embedding this crate.
//!
//! The library itself never installs a global subscriber — it only emits
//! through the `tracing` facade. This module is a convenience for binaries
//! and integration tests that want a sane default (`RUST_LOG`-driven,
//! human-readable) without repeating the boilerplate everywhere.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a process-wide `tracing_subscriber` formatter honoring `RUST_LOG`.
/// Safe to call more than once; only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
