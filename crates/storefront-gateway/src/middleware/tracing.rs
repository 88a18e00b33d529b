//! Request tracing layer.
//!
//! Outermost layer of the gateway. For every request it:
//! - resolves the request id (client `x-request-id` or generated) and writes
//!   it back into the request headers and extensions,
//! - opens an `api_request` span linked to an incoming W3C `traceparent`,
//! - tracks in-flight requests on the `http_active_connections` gauge,
//! - stamps `x-request-id` on the response and records request metrics.

use axum::{body::Body, http::Request, response::Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use tracing::{info, info_span, warn, Instrument, Span};

use crate::domain::correlation::RequestId;
use crate::domain::error::ErrorLabel;
use crate::middleware::metrics::GatewayMetrics;

/// Response extension naming the route and service a request was served by.
///
/// Responses without it are recorded as `unmatched` / `gateway`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLabels {
    pub route: String,
    pub service: String,
}

impl RouteLabels {
    pub fn new(route: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            service: service.into(),
        }
    }
}

/// Tracing layer that creates spans for each request
#[derive(Clone)]
pub struct TracingLayer {
    metrics: Arc<GatewayMetrics>,
}

impl TracingLayer {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Tracing service
#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
    metrics: Arc<GatewayMetrics>,
}

impl<S> Service<Request<Body>> for TracingService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let metrics = Arc::clone(&self.metrics);

        let request_id = RequestId::from_headers(req.headers());
        if let Some(value) = request_id.header_value() {
            req.headers_mut().insert(RequestId::HEADER, value);
        }
        req.extensions_mut().insert(request_id.clone());

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let span = info_span!(
            "api_request",
            request_id = %request_id,
            http.method = %method,
            http.target = %path,
            http.status_code = tracing::field::Empty,
            otel.kind = "server",
            otel.status_code = tracing::field::Empty,
        );
        if let Some(parent) = extract_trace_context(&req) {
            span.follows_from(parent);
        }

        Box::pin(
            async move {
                let started = Instant::now();
                let _in_flight = InFlight::enter(Arc::clone(&metrics));

                let mut response = inner.call(req).await?;

                let status = response.status();
                let span = Span::current();
                span.record("http.status_code", status.as_u16());
                span.record(
                    "otel.status_code",
                    if status.is_server_error() { "ERROR" } else { "OK" },
                );

                if let Some(value) = request_id.header_value() {
                    response.headers_mut().insert(RequestId::HEADER, value);
                }

                let (route, service) = response
                    .extensions()
                    .get::<RouteLabels>()
                    .map(|l| (l.route.clone(), l.service.clone()))
                    .unwrap_or_else(|| ("unmatched".to_string(), "gateway".to_string()));
                let elapsed = started.elapsed();
                metrics.record_request(method.as_str(), &route, status.as_u16(), &service, elapsed);
                if let Some(ErrorLabel(error_type)) = response.extensions().get::<ErrorLabel>() {
                    metrics.record_error(method.as_str(), &route, error_type, &service);
                }

                if status.is_server_error() {
                    warn!(status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, %route, %service, "Request failed");
                } else {
                    info!(status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, %route, %service, "Request completed");
                }

                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// Decrements the in-flight gauge on drop, including when the client
/// disconnects and the request future is dropped.
struct InFlight(Arc<GatewayMetrics>);

impl InFlight {
    fn enter(metrics: Arc<GatewayMetrics>) -> Self {
        metrics.connection_opened();
        Self(metrics)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// Trace and parent span ids from a W3C `traceparent` value
/// (`version-trace_id-parent_id-flags`).
pub fn parse_traceparent(value: &str) -> Option<(&str, &str)> {
    let mut parts = value.split('-');
    let (version, trace_id, parent_id, flags) =
        (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
    (hex(version, 2) && hex(trace_id, 32) && hex(parent_id, 16) && hex(flags, 2))
        .then_some((trace_id, parent_id))
}

/// Span referencing the caller's trace, if the request carries one.
fn extract_trace_context<B>(req: &Request<B>) -> Option<Span> {
    let traceparent = req.headers().get("traceparent")?.to_str().ok()?;
    let (trace_id, parent_id) = parse_traceparent(traceparent)?;
    Some(info_span!(
        "parent_trace",
        trace_id = trace_id,
        parent_span_id = parent_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use tower::{service_fn, ServiceExt};

    use crate::domain::error::ApiError;

    #[test]
    fn test_traceparent_parsing() {
        let parsed = parse_traceparent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
        assert_eq!(
            parsed,
            Some(("0af7651916cd43dd8448eb211c80319c", "b7ad6b7169203331"))
        );
    }

    #[test]
    fn test_invalid_traceparent() {
        assert!(parse_traceparent("invalid").is_none());
        assert!(parse_traceparent("00-short-b7ad6b7169203331-01").is_none());
        assert!(
            parse_traceparent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-xx")
                .is_none()
        );
    }

    #[test]
    fn test_no_traceparent() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(extract_trace_context(&req).is_none());
    }

    #[tokio::test]
    async fn test_request_id_propagates_to_handler_and_response() {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let svc = TracingLayer::new(Arc::clone(&metrics)).layer(service_fn(
            |req: Request<Body>| async move {
                let seen = req.extensions().get::<RequestId>().cloned().unwrap();
                assert_eq!(
                    req.headers().get("x-request-id").unwrap(),
                    seen.as_str()
                );
                Ok::<_, std::convert::Infallible>(StatusCode::OK.into_response())
            },
        ));

        let req = Request::builder()
            .uri("/health")
            .header("x-request-id", "client-abc")
            .body(Body::empty())
            .unwrap();
        let response = svc.oneshot(req).await.unwrap();
        assert_eq!(response.headers().get("x-request-id").unwrap(), "client-abc");
        assert_eq!(metrics.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_generated_id_and_error_metrics() {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let svc = TracingLayer::new(Arc::clone(&metrics)).layer(service_fn(
            |_req: Request<Body>| async move {
                let mut response = ApiError::not_found("/api/nope").into_response();
                response
                    .extensions_mut()
                    .insert(RouteLabels::new("unmatched", "gateway"));
                Ok::<_, std::convert::Infallible>(response)
            },
        ));

        let req = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let response = svc.oneshot(req).await.unwrap();
        let id = response.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(id.starts_with("req_"));

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"error_type="not_found""#));
        assert!(text.contains(r#"status_code="404""#));
    }
}
