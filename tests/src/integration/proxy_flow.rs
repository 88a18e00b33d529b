//! # Proxy Flow
//!
//! Client → gateway → mock backend over real sockets:
//!
//! 1. **Rewrite**: prefix strip and replace reach the right backend path
//! 2. **Identity**: verified principals become `x-user-id` / `x-user-role`
//! 3. **Correlation**: request ids are propagated and echoed
//! 4. **Admission**: 401 / 403 / 404 never reach a backend

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use std::collections::HashMap;

    use super::super::fixtures::{config_with, token, GatewayHarness, MockBackend};
    use storefront_gateway::Role;

    async fn setup() -> (GatewayHarness, MockBackend, MockBackend, MockBackend) {
        let product = MockBackend::spawn("product").await;
        let order = MockBackend::spawn("order").await;
        let user = MockBackend::spawn("user").await;
        let backends = HashMap::from([
            ("product", product.url()),
            ("order", order.url()),
            ("user", user.url()),
        ]);
        let gateway = GatewayHarness::start(config_with(&backends)).await;
        (gateway, product, order, user)
    }

    #[tokio::test]
    async fn test_strip_prefix_and_query_forwarded() {
        let (gw, product, _order, _user) = setup().await;

        let response = gw.get("/api/products/42?color=red", None).await;
        assert_eq!(response.status(), 200);
        assert!(response.headers().contains_key("ratelimit-limit"));

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["service"], "product");
        assert_eq!(body["path"], "/42");
        assert_eq!(body["query"], "color=red");
        assert!(body["userId"].is_null());
        assert_eq!(product.hits(), 1);
    }

    #[tokio::test]
    async fn test_replace_prefix_routes() {
        let (gw, _product, _order, _user) = setup().await;

        let body: Value = gw
            .get("/api/categories/shoes", None)
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(body["service"], "product");
        assert_eq!(body["path"], "/categories/shoes");

        let customer = token(Role::Customer);
        let body: Value = gw
            .get("/api/cart/items", Some(&customer))
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(body["service"], "order");
        assert_eq!(body["path"], "/cart/items");
    }

    #[tokio::test]
    async fn test_identity_headers_injected() {
        let (gw, _product, _order, _user) = setup().await;
        let customer = token(Role::Customer);

        let response = gw
            .client
            .get(gw.url("/api/orders/9"))
            .bearer_auth(&customer)
            .header("x-user-role", "admin")
            .header("x-request-id", "trace-me-1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-request-id"], "trace-me-1");

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["userId"], "customer-7");
        assert_eq!(body["userRole"], "customer");
        assert_eq!(body["requestId"], "trace-me-1");
        assert_eq!(body["forwardedFor"], "127.0.0.1");
    }

    #[tokio::test]
    async fn test_admission_failures_never_reach_backend() {
        let (gw, _product, order, user) = setup().await;

        let response = gw.get("/api/orders", None).await;
        assert_eq!(response.status(), 401);
        assert_eq!(response.headers()["www-authenticate"], "Bearer");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Access token required");

        let response = gw.get("/api/orders", Some("not.a.jwt")).await;
        assert_eq!(response.status(), 401);

        let customer = token(Role::Customer);
        let response = gw.get("/api/admin/users", Some(&customer)).await;
        assert_eq!(response.status(), 403);

        let response = gw.get("/api/ordersummary", None).await;
        assert_eq!(response.status(), 404);

        assert_eq!(order.hits(), 0);
        assert_eq!(user.hits(), 0);
    }

    #[tokio::test]
    async fn test_admin_dispatch() {
        let (gw, _product, _order, user) = setup().await;
        let admin = token(Role::Admin);

        let body: Value = gw
            .get("/api/admin/users/5", Some(&admin))
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(body["service"], "user");
        assert_eq!(body["path"], "/users/5");
        assert_eq!(user.hits(), 1);

        let response = gw.get("/api/admin/warehouse", Some(&admin)).await;
        assert_eq!(response.status(), 404);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Admin endpoint not found");
    }

    #[tokio::test]
    async fn test_post_body_relayed() {
        let (gw, _product, order, _user) = setup().await;
        let customer = token(Role::Customer);

        let response = gw
            .post("/api/orders", Some(&customer), r#"{"sku":"A1"}"#)
            .await;
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["method"], "POST");
        assert_eq!(body["path"], "/");
        assert_eq!(order.hits(), 1);
    }
}
