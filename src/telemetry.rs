//! Tracing subscriber setup.
//!
//! Log sections map to tracing targets (`adaptation`, `ipc`, `sched`);
//! important events log at info (warnings at warn), notable ones at debug,
//! diagnostics at trace. `RUST_LOG` overrides the configured filter.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops (useful under test harnesses that race to initialize).
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    // an already-set subscriber is fine
    let _ = result;
}
