//! Request-path building blocks.
//!
//! Layer order (outermost first):
//! Tracing → CatchPanic → CORS → BodyLimit → handler, where the proxy
//! handler runs the admission pipeline Route → Auth → RateLimit → SlowDown
//! before consulting the target's circuit breaker.
//!
//! ## Circuit Breaker
//!
//! One breaker per backend service. A breaker opens when the failure ratio
//! over its rolling window crosses the configured percentage, rejects calls
//! while open, and lets a single trial through once the open timeout has
//! elapsed.

pub mod auth;
pub mod circuit_breaker;
pub mod cors;
pub mod metrics;
pub mod rate_limit;
pub mod tracing;

pub use auth::{AuthError, AuthGate, Claims};
pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitState, CircuitStats,
    ServiceStats,
};
pub use cors::create_cors_layer;
pub use metrics::GatewayMetrics;
pub use rate_limit::{FixedWindowLimiter, RateLimitDecision, RateLimiter, SlowDown};
pub use tracing::{RouteLabels, TracingLayer};
