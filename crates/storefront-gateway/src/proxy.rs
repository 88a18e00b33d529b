//! Proxy forwarder: breaker-guarded relay of a routed request to its backend.
//!
//! Outcome accounting:
//! - any backend response, whatever its status, is a breaker success,
//! - a transport failure or timeout is a breaker failure and becomes a 503,
//! - a call abandoned because the client went away records nothing.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::Response;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::domain::correlation::RequestId;
use crate::domain::error::{ApiError, ApiResult};
use crate::domain::types::RequestContext;
use crate::middleware::circuit_breaker::CircuitBreakerRegistry;
use crate::middleware::metrics::GatewayMetrics;
use crate::ports::outbound::{BackendClient, BackendResponse, ForwardRequest};

/// Identity header carrying the principal id
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");
/// Identity header carrying the principal role
pub const USER_ROLE_HEADER: HeaderName = HeaderName::from_static("x-user-role");

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single transport hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Relays routed requests to backends.
pub struct ProxyForwarder {
    client: Arc<dyn BackendClient>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<GatewayMetrics>,
    forward_client_ip: bool,
}

impl ProxyForwarder {
    pub fn new(
        client: Arc<dyn BackendClient>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<GatewayMetrics>,
        forward_client_ip: bool,
    ) -> Self {
        Self {
            client,
            breakers,
            metrics,
            forward_client_ip,
        }
    }

    /// Forward the request described by `ctx` and relay the response.
    ///
    /// `ctx.route` must be set; the route stage runs first.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        method: Method,
        headers: &HeaderMap,
        query: Option<&str>,
        body: Bytes,
    ) -> ApiResult<Response> {
        let route = ctx
            .route
            .as_ref()
            .ok_or_else(|| ApiError::UnexpectedFault("proxy reached without a route".into()))?;
        let service = route.service.as_str();
        let (descriptor, breaker) = self
            .breakers
            .descriptor(service)
            .zip(self.breakers.get(service))
            .ok_or_else(|| ApiError::UnexpectedFault(format!("no backend named {service}")))?;

        let Some(permit) = breaker.try_acquire() else {
            self.metrics.set_breaker_state(service, breaker.state());
            warn!(%service, request_id = %ctx.request_id(), "Circuit open, rejecting call");
            return Err(ApiError::service_unavailable(service, "circuit breaker open"));
        };

        let request = ForwardRequest {
            method,
            url: backend_url(&descriptor.base_url, &route.forward_path, query),
            headers: forward_headers(headers, ctx, self.forward_client_ip),
            body,
            timeout: descriptor.timeout,
        };

        let started = Instant::now();
        let outcome = self.client.send(request).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(response) => {
                permit.success();
                self.metrics
                    .record_proxy(service, response.status.as_u16(), elapsed);
                debug!(
                    %service,
                    status = response.status.as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Backend responded"
                );
                Ok(relay(response))
            }
            Err(e) => {
                permit.failure();
                self.metrics.record_proxy_failure(service, elapsed);
                warn!(
                    %service,
                    request_id = %ctx.request_id(),
                    error = %e,
                    kind = e.kind(),
                    "Backend call failed"
                );
                Err(ApiError::service_unavailable(service, e.to_string()))
            }
        };
        self.metrics.set_breaker_state(service, breaker.state());
        result
    }
}

/// `base + path`, plus `?query` when present.
pub fn backend_url(base: &str, path: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match query.filter(|q| !q.is_empty()) {
        Some(q) => format!("{base}{path}?{q}"),
        None => format!("{base}{path}"),
    }
}

/// Hop-by-hop headers plus any named by `Connection`.
fn is_hop_by_hop(name: &HeaderName, connection_listed: &[String]) -> bool {
    HOP_BY_HOP.contains(&name.as_str()) || connection_listed.iter().any(|n| n == name.as_str())
}

fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|n| n.trim().to_ascii_lowercase())
        .filter(|n| !n.is_empty())
        .collect()
}

/// Client headers as sent to the backend.
///
/// Client-supplied identity headers never pass through; they are set only
/// from a verified principal.
pub fn forward_headers(
    incoming: &HeaderMap,
    ctx: &RequestContext,
    forward_client_ip: bool,
) -> HeaderMap {
    let listed = connection_listed(incoming);
    let mut headers = HeaderMap::with_capacity(incoming.len() + 4);
    for (name, value) in incoming {
        if is_hop_by_hop(name, &listed)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == USER_ID_HEADER
            || name == USER_ROLE_HEADER
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(value) = ctx.request_id().header_value() {
        headers.insert(RequestId::HEADER, value);
    }

    if let Some(principal) = &ctx.principal {
        if let Ok(id) = HeaderValue::from_str(&principal.id) {
            headers.insert(USER_ID_HEADER, id);
        }
        headers.insert(
            USER_ROLE_HEADER,
            HeaderValue::from_static(principal.role.as_str()),
        );
    }

    if forward_client_ip {
        if let Some(ip) = ctx.client_ip {
            let chain = match incoming
                .get(&X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.trim().is_empty())
            {
                Some(existing) => format!("{existing}, {ip}"),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
    }

    headers
}

/// Backend response relayed verbatim, minus hop-by-hop framing.
fn relay(backend: BackendResponse) -> Response {
    let listed = connection_listed(&backend.headers);
    let mut response = Response::new(Body::from(backend.body));
    *response.status_mut() = backend.status;
    let headers = response.headers_mut();
    for (name, value) in &backend.headers {
        if is_hop_by_hop(name, &listed) || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    response
}
