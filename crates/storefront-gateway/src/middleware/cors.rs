//! CORS layer built from [`CorsConfig`].

use crate::domain::config::CorsConfig;
use axum::http::{HeaderName, HeaderValue, Method};
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

/// Build the CORS layer, or `None` when CORS is disabled.
///
/// A `*` origin combined with credentials mirrors the request origin, and a
/// `*` header list mirrors the requested headers; tower-http rejects the
/// literal wildcard together with credentials.
pub fn create_cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if !config.enabled {
        return None;
    }

    let wildcard = |list: &[String]| list.iter().any(|v| v == "*");

    let origin = if wildcard(&config.allowed_origins) {
        if config.allow_credentials {
            AllowOrigin::mirror_request()
        } else {
            AllowOrigin::any()
        }
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    let headers = if wildcard(&config.allowed_headers) {
        if config.allow_credentials {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::any()
        }
    } else {
        AllowHeaders::list(
            config
                .allowed_headers
                .iter()
                .filter_map(|h| h.parse::<HeaderName>().ok()),
        )
    };

    let methods: Vec<Method> = config
        .allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    let expose: Vec<HeaderName> = config
        .expose_headers
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();

    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers(headers)
            .expose_headers(expose)
            .allow_credentials(config.allow_credentials)
            .max_age(Duration::from_secs(config.max_age)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    async fn preflight(config: &CorsConfig, origin: &str) -> axum::response::Response {
        let mut app: Router = Router::new().route("/api/products", get(|| async { "ok" }));
        if let Some(layer) = create_cors_layer(config) {
            app = app.layer(layer);
        }
        app.oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/products")
                .header("origin", origin)
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_default_allows_configured_origin() {
        let response = preflight(&CorsConfig::default(), "http://localhost:3000").await;
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "http://localhost:3000"
        );
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-credentials")
                .unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn test_unlisted_origin_gets_no_grant() {
        let response = preflight(&CorsConfig::default(), "https://evil.example").await;
        assert!(response
            .headers()
            .get("access-control-allow-origin")
            .is_none());
    }

    #[tokio::test]
    async fn test_wildcard_with_credentials_mirrors_origin() {
        let config = CorsConfig {
            allowed_origins: vec!["*".to_string()],
            allowed_headers: vec!["*".to_string()],
            ..CorsConfig::default()
        };
        let response = preflight(&config, "https://shop.example").await;
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://shop.example"
        );
    }

    #[test]
    fn test_disabled() {
        let config = CorsConfig {
            enabled: false,
            ..CorsConfig::default()
        };
        assert!(create_cors_layer(&config).is_none());
    }
}
