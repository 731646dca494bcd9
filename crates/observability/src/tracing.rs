//! Tracing/logging initialization.
//!
//! The orchestration crates log with structured `tracing` events; this module
//! wires up the subscriber once at process start.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Reads `RUST_LOG` for filtering, defaulting to `info`. Safe to call multiple
/// times (subsequent calls are no-ops).
pub fn init() {
    init_with_filter("info");
}

/// Initialize with an explicit default filter (overridden by `RUST_LOG`).
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    // JSON logs + timestamps so the API layer can ship them as-is.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
