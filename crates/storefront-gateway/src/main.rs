//! Storefront gateway binary.
//!
//! Configuration comes from the optional JSON file named by `GW_CONFIG` plus
//! environment overrides (`PORT`, `JWT_SECRET`, `<SERVICE>_SERVICE_URL`, ...).
//! Telemetry is configured through `OTEL_*` and `GW_LOG_*` variables.

use anyhow::{Context, Result};
use gateway_telemetry::{init_telemetry, TelemetryConfig};
use storefront_gateway::{GatewayConfig, GatewayService};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::from_env();
    let _guard = init_telemetry(telemetry)
        .await
        .context("Failed to initialize telemetry")?;

    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid gateway configuration");
            return Err(e).context("Failed to load gateway configuration");
        }
    };

    if config.auth.jwt_secret == storefront_gateway::domain::config::AuthConfig::default().jwt_secret {
        warn!("JWT_SECRET not set, using the built-in fallback secret");
    }
    info!(
        addr = %config.http_addr(),
        services = config.services.len(),
        version = storefront_gateway::VERSION,
        "Starting storefront gateway"
    );

    let service = GatewayService::new(config).context("Failed to build gateway")?;
    if let Err(e) = service.run().await {
        error!(error = %e, "Gateway terminated with error");
        return Err(e).context("Gateway server failed");
    }
    Ok(())
}
