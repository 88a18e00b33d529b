//! # Test Fixtures
//!
//! Mock backends and a gateway harness bound to ephemeral local ports.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use storefront_gateway::middleware::Claims;
use storefront_gateway::{GatewayConfig, GatewayService, Principal, Role};

/// Signing secret shared by the harness and issued tokens
pub const TEST_SECRET: &str = "integration-secret";

/// Per-service timeout used by harness configs
pub const SERVICE_TIMEOUT: Duration = Duration::from_millis(300);

/// Every service named by the default route table.
pub const SERVICES: [&str; 9] = [
    "auth",
    "user",
    "product",
    "order",
    "payment",
    "notification",
    "review",
    "search",
    "shipping",
];

#[derive(Clone)]
struct BackendControl {
    name: &'static str,
    slow: Arc<AtomicBool>,
    hits: Arc<AtomicUsize>,
    health_status: Arc<AtomicU16>,
}

/// Backend that echoes what it received as JSON.
///
/// While `slow` is set every request sleeps past [`SERVICE_TIMEOUT`].
pub struct MockBackend {
    pub addr: SocketAddr,
    control: BackendControl,
    handle: JoinHandle<()>,
}

async fn echo(State(control): State<BackendControl>, req: Request) -> impl IntoResponse {
    control.hits.fetch_add(1, Ordering::SeqCst);
    if control.slow.load(Ordering::SeqCst) {
        tokio::time::sleep(SERVICE_TIMEOUT * 4).await;
    }
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "service": control.name,
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "query": req.uri().query(),
        "userId": header("x-user-id"),
        "userRole": header("x-user-role"),
        "requestId": header("x-request-id"),
        "forwardedFor": header("x-forwarded-for"),
    }))
}

async fn health(State(control): State<BackendControl>) -> impl IntoResponse {
    let status = StatusCode::from_u16(control.health_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "service": control.name })))
}

impl MockBackend {
    pub async fn spawn(name: &'static str) -> Self {
        let control = BackendControl {
            name,
            slow: Arc::new(AtomicBool::new(false)),
            hits: Arc::new(AtomicUsize::new(0)),
            health_status: Arc::new(AtomicU16::new(200)),
        };
        let app = Router::new()
            .route("/health", get(health))
            .fallback(echo)
            .with_state(control.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            control,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_slow(&self, slow: bool) {
        self.control.slow.store(slow, Ordering::SeqCst);
    }

    pub fn set_health_status(&self, status: u16) {
        self.control.health_status.store(status, Ordering::SeqCst);
    }

    /// Requests received outside `/health`
    pub fn hits(&self) -> usize {
        self.control.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// URL of a local port with nothing listening.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Default config with the given service URLs; unlisted services point at
/// a closed port.
pub fn config_with(backends: &HashMap<&str, String>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.jwt_secret = TEST_SECRET.into();
    config.health.background_refresh = false;
    for service in &mut config.services {
        service.url = backends
            .get(service.name.as_str())
            .cloned()
            .unwrap_or_else(unreachable_url);
        service.timeout = SERVICE_TIMEOUT;
    }
    config
}

/// Bearer token for a principal holding `role`.
pub fn token(role: Role) -> String {
    let principal = Principal {
        id: format!("{role}-7"),
        email: format!("{role}@example.com"),
        role,
    };
    encode(
        &Header::default(),
        &Claims::for_principal(&principal, 3600),
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Gateway serving on an ephemeral port until dropped.
pub struct GatewayHarness {
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
}

impl GatewayHarness {
    pub async fn start(config: GatewayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = GatewayService::new(config).unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            service
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            client: reqwest::Client::new(),
            shutdown: Some(tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut request = self.client.get(self.url(path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }

    pub async fn post(&self, path: &str, token: Option<&str>, body: &str) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url(path))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }
}

impl Drop for GatewayHarness {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
