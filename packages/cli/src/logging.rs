// ABOUTME: tracing-subscriber installation for the stratus binary
// ABOUTME: RUST_LOG filtering with an info fallback; JSON lines when STRATUS_LOG_JSON is set

use stratus_config::constants::STRATUS_LOG_JSON;
use stratus_config::env_bool;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Safe to call once per process.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if env_bool(STRATUS_LOG_JSON) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}
