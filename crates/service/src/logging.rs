//! Tracing subscriber setup for the service binary.

use tracing_subscriber::EnvFilter;

/// Builds the log filter.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` selects `debug` and the
/// configured level is used.
pub fn build_filter(verbose: bool, configured_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { configured_level };
    EnvFilter::new(level.to_lowercase())
}

/// Installs the global fmt subscriber.
pub fn init(verbose: bool, configured_level: &str) {
    let filter = build_filter(verbose, configured_level);
    // A subscriber may already be installed (tests, embedding applications).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
