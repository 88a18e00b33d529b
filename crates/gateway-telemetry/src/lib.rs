//! # Gateway Telemetry
//!
//! Logging and distributed tracing bootstrap for the storefront gateway.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gateway_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).await?;
//!     // spans and events are now collected
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GW_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter directives |
//! | `GW_JSON_LOGS` | `false` (`true` in containers) | JSON console output |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset | OTLP collector; unset disables export |
//! | `OTEL_SERVICE_NAME` | `storefront-gateway` | Service name in traces |

mod config;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use tracing_setup::{build_env_filter, TracingGuard};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize tracing: {0}")]
    TracerInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Install logging and tracing for the process.
///
/// Returns a guard that must be held for the lifetime of the application.
/// Dropping it flushes pending spans.
pub async fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let tracing_guard = tracing_setup::init_tracing(&config).await?;
    Ok(TelemetryGuard {
        _tracing: tracing_guard,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: TracingGuard,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_installs_once() {
        let config = TelemetryConfig {
            console_output: false,
            ..TelemetryConfig::default()
        };

        let guard = init_telemetry(config.clone()).await.unwrap();
        assert!(!guard._tracing.exporting());

        let second = init_telemetry(config).await;
        assert!(matches!(second, Err(TelemetryError::TracerInit(_))));
    }
}
