//! Logging initialization.
//!
//! stdout belongs to the protocol, so every log line goes to stderr. The
//! filter comes from `RUST_LOG` when set, otherwise from the configured level.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Later calls are ignored.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}
