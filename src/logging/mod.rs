//! Logging infrastructure for Drawbridge
//!
//! Structured tracing with env-filter support and optional JSON output
//! for log shippers.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber. `log_level` is a default directive;
/// `RUST_LOG` overrides it when set. Safe to call once per process.
pub fn init(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        let _ = fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}
