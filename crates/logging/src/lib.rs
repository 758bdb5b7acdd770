//! MixCraft Logging
//!
//! `tracing` subscriber setup shared by binaries and tests. `RUST_LOG`
//! overrides the default filter in both cases.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter for relay nodes
pub const DEFAULT_FILTER: &str = "info,mixcraft=debug";

fn filter_or(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_logging(default_directive: &str) -> bool {
    let installed = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter_or(default_directive))
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("Logging initialised");
    }
    installed
}

/// Subscriber for tests: output captured by the test harness, quiet by
/// default. Safe to call from every test.
pub fn try_init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("warn"))
        .with_test_writer()
        .try_init();
}
