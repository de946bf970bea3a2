//! Structured logging setup.
//!
//! Verbosity comes from `RUST_LOG`; without it everything logs at `info`
//! and the watcher crates at `debug`.

use tipwatch_types::{Result, TipwatchError};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const DEFAULT_FILTER: &str =
    "info,tipwatch_tx=debug,tipwatch_relay=debug,tipwatch_balance=debug,tipwatch_service=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a compact human-readable subscriber.
///
/// Example RUST_LOG values:
/// - `info` - all info and above
/// - `tipwatch_relay=trace,reqwest=warn` - trace relays, quiet HTTP
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| TipwatchError::Config(format!("telemetry already initialized: {}", e)))
}

/// Install a JSON subscriber for log aggregation.
pub fn init_telemetry_json() -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_span_events(FmtSpan::CLOSE))
        .try_init()
        .map_err(|e| TipwatchError::Config(format!("telemetry already initialized: {}", e)))
}
