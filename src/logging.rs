//! Tracing subscriber setup for canopy binaries.
//!
//! Library code only emits events; installing a subscriber is left to the
//! binary entry point.

use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber filtered by `RUST_LOG`, defaulting
/// to `info`. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();
}
