//! Storefront API gateway: the resilience and routing core in front of the
//! storefront backend services.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────────────────────┐
//!  client ───────▶ │ Tracing → CatchPanic → CORS → BodyLimit      │
//!                  ├──────────────────────────────────────────────┤
//!                  │ Pipeline: Route → Auth → RateLimit → SlowDown │
//!                  ├──────────────────────────────────────────────┤
//!                  │ CircuitBreakerRegistry ─▶ ProxyForwarder     │ ───▶ backend
//!                  └──────────────────────────────────────────────┘
//!                        │                         ▲
//!                        ▼                         │
//!                  GatewayMetrics          HealthAggregator (probes)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use storefront_gateway::{GatewayConfig, GatewayService};
//!
//! let config = GatewayConfig::load()?;
//! GatewayService::new(config)?.run().await?;
//! ```
//!
//! # Resilience
//!
//! - Per-service circuit breakers over a rolling failure-ratio window
//! - Global and per-route fixed-window rate limits with graduated slow-down
//! - Every backend call and health probe bounded by the service timeout

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod domain;
pub mod health;
pub mod middleware;
pub mod pipeline;
pub mod ports;
pub mod proxy;
pub mod router;
pub mod service;

// Re-exports for public API
pub use domain::config::GatewayConfig;
pub use domain::error::{ApiError, ApiResult, GatewayError};
pub use domain::types::*;
pub use health::HealthAggregator;
pub use middleware::{AuthGate, CircuitBreaker, CircuitBreakerRegistry, CircuitState, GatewayMetrics, RateLimiter};
pub use pipeline::Pipeline;
pub use proxy::ProxyForwarder;
pub use router::{RouteTable, RouteRule};
pub use service::{shutdown_signal, GatewayService, GatewayState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_config_builds_state() {
        let mut config = GatewayConfig::default();
        config.health.background_refresh = false;
        tokio_test::assert_ok!(GatewayState::new(config));
    }
}
