//! # Health Flow
//!
//! 1. **Aggregation**: one entry per service, classified healthy / degraded
//!    / unhealthy, bounded by the slowest service timeout
//! 2. **Liveness**: `GET /health` answers without touching backends
//! 3. **Metrics**: `GET /metrics` exposes request and breaker families

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    use super::super::fixtures::{
        config_with, GatewayHarness, MockBackend, SERVICES, SERVICE_TIMEOUT,
    };

    #[tokio::test]
    async fn test_aggregate_report_classifies_every_service() {
        let auth = MockBackend::spawn("auth").await;
        let search = MockBackend::spawn("search").await;
        search.set_health_status(503);

        // Accepts connections (via the backlog) but never answers.
        let blackhole = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let blackhole_url = format!("http://{}", blackhole.local_addr().unwrap());

        let backends = HashMap::from([
            ("auth", auth.url()),
            ("search", search.url()),
            ("order", blackhole_url),
        ]);
        let gw = GatewayHarness::start(config_with(&backends)).await;

        let started = Instant::now();
        let response = gw.get("/api/health/services", None).await;
        let elapsed = started.elapsed();
        assert_eq!(response.status(), 200);
        assert!(elapsed < SERVICE_TIMEOUT + Duration::from_millis(700));

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], true);
        let report = &body["data"];
        assert_eq!(report["status"], "degraded");

        let services = report["services"].as_object().unwrap();
        assert_eq!(services.len(), SERVICES.len());
        assert_eq!(services["auth"]["status"], "healthy");
        assert_eq!(services["search"]["status"], "degraded");
        assert_eq!(services["order"]["status"], "unhealthy");
        assert!(services["order"]["error"].is_string());
        assert_eq!(services["payment"]["status"], "unhealthy");
        assert!(services["auth"]["responseTime"].is_u64());
    }

    #[tokio::test]
    async fn test_all_backends_healthy() {
        let mut mocks = Vec::new();
        let mut backends = HashMap::new();
        for name in SERVICES {
            let mock = MockBackend::spawn(name).await;
            backends.insert(name, mock.url());
            mocks.push(mock);
        }
        let gw = GatewayHarness::start(config_with(&backends)).await;

        let body: Value = gw
            .get("/api/health/services", None)
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["status"], "healthy");
        assert!(mocks.iter().all(|m| m.hits() == 0));
    }

    #[tokio::test]
    async fn test_liveness_and_metrics() {
        let gw = GatewayHarness::start(config_with(&HashMap::new())).await;

        let response = gw.get("/health", None).await;
        assert_eq!(response.status(), 200);
        assert!(response.headers().contains_key("x-request-id"));
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["message"], "API Gateway is healthy");
        assert!(body["uptime"].is_u64());

        // A proxied call to a dead backend feeds the proxy families.
        assert_eq!(gw.get("/api/search?q=x", None).await.status(), 503);

        let text = gw.get("/metrics", None).await.text().await.unwrap();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains(r#"proxy_requests_total{service="search",status_code="error"} 1"#));
        assert!(text.contains(r#"circuit_breaker_state{service="order"} 0"#));
        assert!(text.contains("http_active_connections"));
    }
}
