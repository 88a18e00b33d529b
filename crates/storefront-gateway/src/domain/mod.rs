//! Domain types for the API Gateway.
//!
//! Configuration, error taxonomy, response envelope, request id and the
//! per-request context. Nothing here performs I/O except config loading.

pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::{
    BreakerSettings, ConfigError, GatewayConfig, KeyScope, RateLimitPolicy, ServiceConfig,
};
pub use correlation::RequestId;
pub use envelope::ApiEnvelope;
pub use error::{ApiError, ApiResult, GatewayError};
pub use types::*;
