//! # Resilience Flow
//!
//! 1. **Breaker**: timeouts trip the breaker, open short-circuits without
//!    network I/O, a trial after the open timeout closes it again
//! 2. **Admin reset**: forces a tripped breaker closed
//! 3. **Rate limits**: N admitted, N+1 rejected with `Retry-After`, also
//!    under concurrent arrivals

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use super::super::fixtures::{config_with, token, GatewayHarness, MockBackend};
    use storefront_gateway::domain::config::{BreakerSettings, RateLimitPolicy};
    use storefront_gateway::{GatewayConfig, Role};

    fn breaker_config(order_url: String) -> GatewayConfig {
        let mut config = config_with(&HashMap::from([("order", order_url)]));
        config.circuit_breaker = BreakerSettings {
            volume_threshold: 3,
            timeout: Duration::from_millis(500),
            ..BreakerSettings::default()
        };
        config
    }

    async fn order_state(gw: &GatewayHarness, admin: &str) -> String {
        let stats: Value = gw
            .get("/api/stats/services", Some(admin))
            .await
            .json()
            .await
            .unwrap();
        stats["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["name"] == "order")
            .map(|s| s["circuitBreakerState"].as_str().unwrap().to_string())
            .unwrap()
    }

    #[tokio::test]
    async fn test_breaker_trips_and_recovers() {
        let order = MockBackend::spawn("order").await;
        let gw = GatewayHarness::start(breaker_config(order.url())).await;
        let customer = token(Role::Customer);
        let admin = token(Role::Admin);

        order.set_slow(true);
        for _ in 0..3 {
            let response = gw.get("/api/orders", Some(&customer)).await;
            assert_eq!(response.status(), 503);
        }
        assert_eq!(order_state(&gw, &admin).await, "open");

        // Open: rejected immediately, backend untouched.
        let started = Instant::now();
        let response = gw.get("/api/orders", Some(&customer)).await;
        assert_eq!(response.status(), 503);
        assert!(started.elapsed() < Duration::from_millis(250));
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Service order is temporarily unavailable");
        assert_eq!(order.hits(), 3);

        // After the open timeout a single trial closes it.
        order.set_slow(false);
        tokio::time::sleep(Duration::from_millis(600)).await;
        let response = gw.get("/api/orders", Some(&customer)).await;
        assert_eq!(response.status(), 200);
        assert_eq!(order_state(&gw, &admin).await, "closed");
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let order = MockBackend::spawn("order").await;
        let gw = GatewayHarness::start(breaker_config(order.url())).await;
        let customer = token(Role::Customer);
        let admin = token(Role::Admin);

        order.set_slow(true);
        for _ in 0..3 {
            gw.get("/api/orders", Some(&customer)).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        let response = gw.get("/api/orders", Some(&customer)).await;
        assert_eq!(response.status(), 503);
        assert_eq!(order_state(&gw, &admin).await, "open");
        assert_eq!(order.hits(), 4);
    }

    #[tokio::test]
    async fn test_admin_reset_closes_breaker() {
        let order = MockBackend::spawn("order").await;
        let gw = GatewayHarness::start(breaker_config(order.url())).await;
        let customer = token(Role::Customer);
        let admin = token(Role::Admin);

        order.set_slow(true);
        for _ in 0..3 {
            gw.get("/api/orders", Some(&customer)).await;
        }
        order.set_slow(false);
        assert_eq!(gw.get("/api/orders", Some(&customer)).await.status(), 503);

        let response = gw
            .post("/api/admin/circuit-breaker/reset/order", Some(&admin), "")
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(order_state(&gw, &admin).await, "closed");
        assert_eq!(gw.get("/api/orders", Some(&customer)).await.status(), 200);

        let response = gw
            .post("/api/admin/circuit-breaker/reset/order", Some(&customer), "")
            .await;
        assert_eq!(response.status(), 403);
    }

    #[tokio::test]
    async fn test_route_policy_rejects_after_max() {
        let search = MockBackend::spawn("search").await;
        let mut config = config_with(&HashMap::from([("search", search.url())]));
        config.rate_limit.policies.insert(
            "search".into(),
            RateLimitPolicy::new(Duration::from_secs(60), 3, "Search rate limit exceeded"),
        );
        let gw = GatewayHarness::start(config).await;

        for remaining in [2, 1, 0] {
            let response = gw.get("/api/search?q=boots", None).await;
            assert_eq!(response.status(), 200);
            assert_eq!(
                response.headers()["ratelimit-remaining"],
                remaining.to_string().as_str()
            );
        }

        let response = gw.get("/api/search?q=boots", None).await;
        assert_eq!(response.status(), 429);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(response.headers()["ratelimit-remaining"], "0");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Search rate limit exceeded");
        assert_eq!(search.hits(), 3);

        // Other routes keep their own counters.
        assert_ne!(gw.get("/api/products", None).await.status(), 429);
    }

    #[tokio::test]
    async fn test_concurrent_arrivals_respect_max() {
        let search = MockBackend::spawn("search").await;
        let mut config = config_with(&HashMap::from([("search", search.url())]));
        config.rate_limit.policies.insert(
            "search".into(),
            RateLimitPolicy::new(Duration::from_secs(60), 5, "Search rate limit exceeded"),
        );
        let gw = GatewayHarness::start(config).await;

        let statuses = join_all((0..20).map(|i| {
            let request = gw.client.get(gw.url(&format!("/api/search?q={i}")));
            async move { request.send().await.unwrap().status().as_u16() }
        }))
        .await;

        assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 5);
        assert_eq!(statuses.iter().filter(|s| **s == 429).count(), 15);
        assert_eq!(search.hits(), 5);
    }
}
