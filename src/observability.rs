//! Logging initialisation
//!
//! Structured logging via `tracing`; the filter comes from `RUST_LOG` with a
//! sensible default, and JSON output is available for log shippers.

use tracing_subscriber::EnvFilter;

/// Initialises the global subscriber. Call once, from the binary.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hermes=info,warn"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
