//! Outbound ports for the gateway.
//!
//! The proxy forwarder and health aggregator talk to backends only through
//! [`BackendClient`], so tests can substitute scripted backends.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use std::time::Duration;

/// Fully prepared backend request.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Absolute URL including query
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whole-call deadline
    pub timeout: Duration,
}

/// Buffered backend response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Transport-level failure; no response was received.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl BackendError {
    /// Log/metric label
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Timeout(_) => "timeout",
            BackendError::Connect(_) => "connect",
            BackendError::Transport(_) => "transport",
        }
    }
}

/// HTTP client used to reach backend services.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Send a request and buffer the full response.
    ///
    /// Any status code is a successful call; only transport failures and
    /// timeouts are errors.
    async fn send(&self, request: ForwardRequest) -> Result<BackendResponse, BackendError>;

    /// `GET url` with `timeout`, returning only the status.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<StatusCode, BackendError>;
}
