//! `tracing` subscriber setup.
//!
//! The library only emits events; binaries and tests decide whether to
//! install a subscriber. Filtering follows `RUST_LOG` and defaults to `info`.

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

/// Install a global fmt subscriber. Safe to call more than once; only the
/// first call has an effect.
pub fn init() {
    let _ = try_init();
}

/// Like [`init`], but reports whether a global subscriber was already set.
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
}

/// Subscriber for tests: writes through the test harness capture.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}
