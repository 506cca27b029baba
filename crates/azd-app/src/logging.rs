//! Tracing setup for the CLI

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber
///
/// Defaults to warnings only so service output stays readable; `RUST_LOG`
/// opens it up for debugging.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
