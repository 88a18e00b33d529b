//! `reqwest` implementation of [`BackendClient`].

use async_trait::async_trait;
use axum::http::StatusCode;
use std::time::Duration;
use tracing::debug;

use crate::domain::config::ProxyConfig;
use crate::domain::error::GatewayError;
use crate::ports::outbound::{BackendClient, BackendError, BackendResponse, ForwardRequest};

/// Pooled HTTP client shared by all backend calls.
///
/// Redirects are relayed to the client, never followed.
#[derive(Clone)]
pub struct ReqwestBackendClient {
    client: reqwest::Client,
}

impl ReqwestBackendClient {
    pub fn new(config: &ProxyConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| GatewayError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout)
    } else if err.is_connect() {
        BackendError::Connect(err.to_string())
    } else {
        BackendError::Transport(err.to_string())
    }
}

#[async_trait]
impl BackendClient for ReqwestBackendClient {
    async fn send(&self, request: ForwardRequest) -> Result<BackendResponse, BackendError> {
        let timeout = request.timeout;
        debug!(method = %request.method, url = %request.url, "Forwarding to backend");

        let response = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        // The deadline covers the body too; a truncated body is a failure.
        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;

        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }

    async fn probe(&self, url: &str, timeout: Duration) -> Result<StatusCode, BackendError> {
        self.client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map(|r| r.status())
            .map_err(|e| classify(e, timeout))
    }
}
