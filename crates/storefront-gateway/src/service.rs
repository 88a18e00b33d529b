//! Gateway service: HTTP surface, shared state and process lifecycle.
//!
//! ## Endpoints
//!
//! | method | path | access |
//! |--------|------|--------|
//! | GET | `/health` | public |
//! | GET | `/metrics` | public, when enabled |
//! | GET | `/api/health/services` | public |
//! | GET | `/api/stats/services` | admin |
//! | POST | `/api/admin/circuit-breaker/reset/:service` | admin |
//! | any | everything else | admission pipeline, then proxy |

use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use crate::adapters::http_client::ReqwestBackendClient;
use crate::domain::config::GatewayConfig;
use crate::domain::correlation::RequestId;
use crate::domain::envelope::ApiEnvelope;
use crate::domain::error::{insert_rate_limit_headers, ApiError, GatewayError};
use crate::domain::types::{AuthRequirement, Principal, RequestContext, Role, ServiceDescriptor};
use crate::health::{health_refresh_task, HealthAggregator};
use crate::middleware::auth::AuthGate;
use crate::middleware::circuit_breaker::CircuitBreakerRegistry;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::rate_limit::{cleanup_task, RateLimiter};
use crate::middleware::{create_cors_layer, RouteLabels, TracingLayer};
use crate::pipeline::{Pipeline, RequestHead};
use crate::ports::outbound::BackendClient;
use crate::proxy::ProxyForwarder;
use crate::router::RouteTable;
use crate::VERSION;


/// Everything a request handler needs. Built once at startup.
pub struct GatewayState {
    config: Arc<GatewayConfig>,
    pipeline: Pipeline,
    proxy: ProxyForwarder,
    breakers: Arc<CircuitBreakerRegistry>,
    health: HealthAggregator,
    limiter: Arc<RateLimiter>,
    gate: Arc<AuthGate>,
    metrics: Arc<GatewayMetrics>,
    started: Instant,
}

impl GatewayState {
    /// State backed by the pooled `reqwest` client.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = ReqwestBackendClient::new(&config.proxy)?;
        Self::with_client(config, Arc::new(client))
    }

    /// State backed by an arbitrary backend client.
    pub fn with_client(
        config: GatewayConfig,
        client: Arc<dyn BackendClient>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let metrics = Arc::new(GatewayMetrics::new()?);
        let descriptors = ServiceDescriptor::from_config(&config);
        let breakers = Arc::new(CircuitBreakerRegistry::new(descriptors.clone()));
        for descriptor in &descriptors {
            if let Some(breaker) = breakers.get(&descriptor.name) {
                metrics.set_breaker_state(&descriptor.name, breaker.state());
            }
        }

        let table = Arc::new(RouteTable::new(
            &config.routes.mount,
            config.routes.rules.clone(),
        ));
        let gate = Arc::new(AuthGate::new(&config.auth));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        let pipeline = Pipeline::standard(
            table,
            Arc::clone(&gate),
            Arc::clone(&limiter),
            Arc::clone(&metrics),
        );
        let proxy = ProxyForwarder::new(
            Arc::clone(&client),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
            config.proxy.forward_client_ip,
        );
        let health = HealthAggregator::new(
            client,
            descriptors,
            config.health.probe_path.clone(),
            Arc::clone(&metrics),
        );

        Ok(Self {
            config: Arc::new(config),
            pipeline,
            proxy,
            breakers,
            health,
            limiter,
            gate,
            metrics,
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    fn expose_internal(&self) -> bool {
        self.config.http.expose_internal_errors
    }

    /// Admin principal or the 401/403 to send back.
    fn require_admin(&self, headers: &HeaderMap, route: &str) -> Result<Principal, ApiError> {
        let verdict = self
            .gate
            .authenticate(headers, AuthRequirement::Required)
            .and_then(|principal| {
                AuthGate::authorize(principal.as_ref(), &[Role::Admin]).map(|()| principal)
            });
        match verdict {
            Ok(Some(principal)) => Ok(principal),
            Ok(None) => Err(ApiError::authentication_required()),
            Err(e) => {
                self.metrics.record_auth_failure(route, e.reason());
                Err(e.into())
            }
        }
    }
}

type SharedState = Arc<GatewayState>;

/// Request id assigned by the tracing layer.
fn request_id_of(headers: &HeaderMap) -> RequestId {
    RequestId::from_headers(headers)
}

fn labelled(mut response: Response, route: &str, service: &str) -> Response {
    response
        .extensions_mut()
        .insert(RouteLabels::new(route, service));
    response
}

/// Error response for an operational endpoint.
fn ops_error(state: &GatewayState, err: ApiError, headers: &HeaderMap, route: &str) -> Response {
    labelled(
        err.to_response(&request_id_of(headers), state.expose_internal()),
        route,
        "gateway",
    )
}

async fn gateway_health(State(state): State<SharedState>) -> Response {
    let body = json!({
        "success": true,
        "message": "API Gateway is healthy",
        "timestamp": chrono::Utc::now(),
        "version": VERSION,
        "uptime": state.started.elapsed().as_secs(),
    });
    labelled(Json(body).into_response(), "/health", "gateway")
}

async fn metrics_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if !state.config.http.metrics_enabled {
        return ops_error(&state, ApiError::not_found("/metrics"), &headers, "/metrics");
    }
    match state.metrics.encode() {
        Ok(text) => labelled(
            (
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                )],
                text,
            )
                .into_response(),
            "/metrics",
            "gateway",
        ),
        Err(e) => ops_error(
            &state,
            ApiError::UnexpectedFault(e.to_string()),
            &headers,
            "/metrics",
        ),
    }
}

async fn services_health(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let report = state.health.check_all().await;
    let envelope = ApiEnvelope::ok(report).with_request_id(request_id_of(&headers).as_str());
    labelled(envelope.into_response(), "/health/services", "gateway")
}

async fn service_stats(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    const ROUTE: &str = "/stats/services";
    if let Err(e) = state.require_admin(&headers, ROUTE) {
        return ops_error(&state, e, &headers, ROUTE);
    }
    let envelope =
        ApiEnvelope::ok(state.breakers.stats()).with_request_id(request_id_of(&headers).as_str());
    labelled(envelope.into_response(), ROUTE, "gateway")
}

async fn reset_breaker(
    State(state): State<SharedState>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Response {
    const ROUTE: &str = "/admin/circuit-breaker/reset";
    let principal = match state.require_admin(&headers, ROUTE) {
        Ok(p) => p,
        Err(e) => return ops_error(&state, e, &headers, ROUTE),
    };

    if !state.breakers.reset(&service) {
        let err = ApiError::RouteNotFound {
            message: format!("Service {service} not found"),
            path: format!("/api/admin/circuit-breaker/reset/{service}"),
        };
        return ops_error(&state, err, &headers, ROUTE);
    }
    if let Some(breaker) = state.breakers.get(&service) {
        state.metrics.set_breaker_state(&service, breaker.state());
    }
    info!(%service, admin = %principal.id, "Circuit breaker reset by admin");

    let envelope = ApiEnvelope::message(format!("Circuit breaker reset for service: {service}"))
        .with_request_id(request_id_of(&headers).as_str());
    labelled(envelope.into_response(), ROUTE, "gateway")
}

/// Fallback: admission pipeline, then the proxy forwarder.
async fn proxy_handler(State(state): State<SharedState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let request_id = parts
        .extensions
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(|| request_id_of(&parts.headers));
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = state.limiter.client_key(&parts.headers, peer);
    let mut ctx = RequestContext::new(request_id, client_ip);

    let head = RequestHead {
        method: &parts.method,
        path: parts.uri.path(),
        headers: &parts.headers,
    };

    let outcome = match state.pipeline.run(&head, &mut ctx).await {
        Ok(()) => match to_bytes(body, state.config.http.max_body_size).await {
            Ok(bytes) => {
                state
                    .proxy
                    .forward(
                        &ctx,
                        parts.method.clone(),
                        &parts.headers,
                        parts.uri.query(),
                        bytes,
                    )
                    .await
            }
            Err(_) => Err(ApiError::PayloadTooLarge {
                limit: state.config.http.max_body_size,
            }),
        },
        Err(e) => Err(e),
    };

    let mut response = match outcome {
        Ok(response) => response,
        Err(e) => {
            let mut response = e.to_response(ctx.request_id(), state.expose_internal());
            if let ApiError::RateLimitExceeded {
                limit, retry_after, ..
            } = &e
            {
                insert_rate_limit_headers(response.headers_mut(), *limit, 0, *retry_after);
            }
            response
        }
    };

    if let Some(snapshot) = ctx.rate_limit {
        insert_rate_limit_headers(
            response.headers_mut(),
            snapshot.limit,
            snapshot.remaining,
            snapshot.reset_after,
        );
    }
    labelled(response, ctx.route_label(), ctx.service_label())
}

/// 500 envelope for a panicking handler.
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Request handler panicked");
    ApiError::UnexpectedFault("handler panicked".into())
        .to_response(&RequestId::generate(), false)
}

/// HTTP front end of the gateway.
pub struct GatewayService {
    state: SharedState,
}

impl GatewayService {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        Ok(Self::from_state(GatewayState::new(config)?))
    }

    pub fn from_state(state: GatewayState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Full router with every layer applied.
    pub fn router(&self) -> Router {
        let config = &self.state.config;

        let mut router = Router::new()
            .route("/health", get(gateway_health))
            .route("/metrics", get(metrics_handler))
            .route("/api/health/services", get(services_health))
            .route("/api/stats/services", get(service_stats))
            .route(
                "/api/admin/circuit-breaker/reset/:service",
                post(reset_breaker),
            )
            .fallback(proxy_handler)
            .with_state(Arc::clone(&self.state))
            .layer(RequestBodyLimitLayer::new(config.http.max_body_size));

        if let Some(cors) = create_cors_layer(&config.cors) {
            router = router.layer(cors);
        }

        router
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(TracingLayer::new(self.state.metrics()))
    }

    /// Start the rate-limit sweep and, if enabled, the health refresh loop.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let config = &self.state.config;
        let mut tasks = vec![tokio::spawn(cleanup_task(
            Arc::clone(&self.state.limiter),
            config.rate_limit.cleanup_interval,
        ))];
        if config.health.background_refresh {
            tasks.push(tokio::spawn(health_refresh_task(
                self.state.health.clone(),
                config.health.refresh_interval,
            )));
        }
        tasks
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind(e.to_string()))?;
        let tasks = self.spawn_background_tasks();
        let app = self.router();

        info!(%addr, services = self.state.breakers.services().len(), "Gateway listening");
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| GatewayError::Server(e.to_string()));

        for task in tasks {
            task.abort();
        }
        info!("Gateway stopped");
        result
    }

    /// Bind the configured address and serve until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<(), GatewayError> {
        let addr = self.state.config.http_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{addr}: {e}")))?;
        self.serve(listener, shutdown_signal()).await
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
