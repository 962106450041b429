//! Tracing subscriber setup

use crate::config::TelemetryConfig;
use crate::error::{CoreError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns an error if a global
/// subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| CoreError::TracingInit(e.to_string()))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .map_err(|e| CoreError::TracingInit(e.to_string()))
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init()
            .map_err(|e| CoreError::TracingInit(e.to_string()))
    }
}
