//! Gateway error taxonomy.
//!
//! [`ApiError`] is what a client sees: every variant maps to one status code
//! and renders as the standard envelope. [`GatewayError`] covers startup and
//! runtime faults of the process itself.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Duration;

use super::correlation::RequestId;
use super::envelope::ApiEnvelope;

/// Client-facing gateway error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// Missing, malformed, invalid or expired credential
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Valid credential, role not permitted
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Quota exhausted for the caller's key
    #[error("rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        limit: u32,
        retry_after: Duration,
    },

    /// Breaker open, or backend timed out / refused the connection
    #[error("service {service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// No route rule matches
    #[error("{message}: {path}")]
    RouteNotFound { message: String, path: String },

    /// Body exceeds the configured limit
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Anything else, including programming errors
    #[error("unexpected fault: {0}")]
    UnexpectedFault(String),
}

impl ApiError {
    /// No bearer credential on a route that requires one
    pub fn missing_token() -> Self {
        Self::Authentication("Access token required".into())
    }

    /// Credential failed signature or expiry checks
    pub fn invalid_token() -> Self {
        Self::Authentication("Invalid or expired token".into())
    }

    /// Role-gated route reached without a principal
    pub fn authentication_required() -> Self {
        Self::Authentication("Authentication required".into())
    }

    /// Principal's role not in the route's allowed set
    pub fn insufficient_permissions() -> Self {
        Self::Authorization("Insufficient permissions".into())
    }

    /// Backend unavailable
    pub fn service_unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Generic 404
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::RouteNotFound {
            message: "Endpoint not found".into(),
            path: path.into(),
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnexpectedFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable label used in metrics and logs
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Authorization(_) => "authorization",
            Self::RateLimitExceeded { .. } => "rate_limit",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::RouteNotFound { .. } => "not_found",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::UnexpectedFault(_) => "internal",
        }
    }

    /// Message placed in the envelope's `error` field.
    ///
    /// Internal detail is withheld unless `expose_internal` is set.
    pub fn client_message(&self, expose_internal: bool) -> String {
        match self {
            Self::Authentication(msg) | Self::Authorization(msg) => msg.clone(),
            Self::RateLimitExceeded { message, .. } => message.clone(),
            Self::ServiceUnavailable { service, .. } => {
                format!("Service {service} is temporarily unavailable")
            }
            Self::RouteNotFound { message, .. } => message.clone(),
            Self::PayloadTooLarge { limit } => {
                format!("Request body exceeds {limit} bytes")
            }
            Self::UnexpectedFault(detail) if expose_internal => detail.clone(),
            Self::UnexpectedFault(_) => "Internal server error".into(),
        }
    }

    /// Render the envelope response, tagged with `request_id`.
    pub fn to_response(&self, request_id: &RequestId, expose_internal: bool) -> Response {
        let mut envelope = ApiEnvelope::failure(self.client_message(expose_internal))
            .with_request_id(request_id.as_str());
        if let Self::RouteNotFound { path, .. } = self {
            envelope = envelope.with_path(path.clone());
        }

        let mut response = (self.status(), envelope).into_response();
        let headers = response.headers_mut();
        match self {
            Self::Authentication(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer"),
                );
            }
            Self::RateLimitExceeded { retry_after, .. } => {
                let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            _ => {}
        }
        if let Some(value) = request_id.header_value() {
            headers.insert(RequestId::HEADER, value);
        }
        response.extensions_mut().insert(ErrorLabel(self.error_type()));
        response
    }
}

/// Response extension marking a gateway-generated error, read by the
/// request metrics layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorLabel(pub &'static str);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = RequestId::generate();
        self.to_response(&request_id, false)
    }
}

/// Extend `headers` with the standard `RateLimit-*` trio.
pub fn insert_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset: Duration) {
    headers.insert("ratelimit-limit", HeaderValue::from(limit));
    headers.insert("ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert(
        "ratelimit-reset",
        HeaderValue::from(reset.as_secs_f64().ceil() as u64),
    );
}

/// Result type for request handling
pub type ApiResult<T> = Result<T, ApiError>;

/// Process-level gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Server socket bind error
    #[error("server bind error: {0}")]
    Bind(String),

    /// Upstream HTTP client could not be built
    #[error("http client error: {0}")]
    HttpClient(String),

    /// Metric registration failed
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Server I/O failure after startup
    #[error("server error: {0}")]
    Server(String),
}

impl From<prometheus::Error> for GatewayError {
    fn from(e: prometheus::Error) -> Self {
        GatewayError::Metrics(e.to_string())
    }
}
