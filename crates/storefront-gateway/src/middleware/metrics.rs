//! Prometheus metrics sink.
//!
//! Every metric lives in a registry owned by [`GatewayMetrics`] so that
//! independent gateway instances (and tests) never share counters.
//!
//! ## Metric families
//!
//! | name | type | labels |
//! |------|------|--------|
//! | `http_requests_total` | counter | method, route, status_code, service |
//! | `http_request_duration_seconds` | histogram | method, route, status_code, service |
//! | `http_errors_total` | counter | method, route, error_type, service |
//! | `proxy_requests_total` | counter | service, status_code |
//! | `proxy_request_duration_seconds` | histogram | service |
//! | `circuit_breaker_state` | gauge | service |
//! | `service_health` | gauge | service |
//! | `rate_limit_exceeded_total` | counter | route |
//! | `auth_failures_total` | counter | route, reason |
//! | `http_active_connections` | gauge | |

use prometheus::{
    core::Collector, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::domain::types::HealthStatus;
use crate::middleware::circuit_breaker::CircuitState;

const REQUEST_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Gateway metrics
pub struct GatewayMetrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    http_errors: IntCounterVec,
    proxy_requests: IntCounterVec,
    proxy_duration: HistogramVec,
    breaker_state: IntGaugeVec,
    service_health: IntGaugeVec,
    rate_limit_exceeded: IntCounterVec,
    auth_failures: IntCounterVec,
    active_connections: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "route", "status_code", "service"],
        )?;
        let http_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Duration of HTTP requests in seconds",
            )
            .buckets(REQUEST_BUCKETS.to_vec()),
            &["method", "route", "status_code", "service"],
        )?;
        let http_errors = IntCounterVec::new(
            Opts::new("http_errors_total", "Total number of HTTP errors"),
            &["method", "route", "error_type", "service"],
        )?;
        let proxy_requests = IntCounterVec::new(
            Opts::new("proxy_requests_total", "Total number of proxied requests"),
            &["service", "status_code"],
        )?;
        let proxy_duration = HistogramVec::new(
            HistogramOpts::new(
                "proxy_request_duration_seconds",
                "Duration of backend calls in seconds",
            )
            .buckets(REQUEST_BUCKETS.to_vec()),
            &["service"],
        )?;
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            &["service"],
        )?;
        let service_health = IntGaugeVec::new(
            Opts::new(
                "service_health",
                "Service health status (0=healthy, 1=degraded, 2=unhealthy)",
            ),
            &["service"],
        )?;
        let rate_limit_exceeded = IntCounterVec::new(
            Opts::new(
                "rate_limit_exceeded_total",
                "Total number of rate-limited requests",
            ),
            &["route"],
        )?;
        let auth_failures = IntCounterVec::new(
            Opts::new("auth_failures_total", "Total number of authentication failures"),
            &["route", "reason"],
        )?;
        let active_connections = IntGauge::new(
            "http_active_connections",
            "Number of requests currently in flight",
        )?;

        let registry = Registry::new();
        let collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(http_requests.clone()),
            Box::new(http_duration.clone()),
            Box::new(http_errors.clone()),
            Box::new(proxy_requests.clone()),
            Box::new(proxy_duration.clone()),
            Box::new(breaker_state.clone()),
            Box::new(service_health.clone()),
            Box::new(rate_limit_exceeded.clone()),
            Box::new(auth_failures.clone()),
            Box::new(active_connections.clone()),
        ];
        for collector in collectors {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            http_requests,
            http_duration,
            http_errors,
            proxy_requests,
            proxy_duration,
            breaker_state,
            service_health,
            rate_limit_exceeded,
            auth_failures,
            active_connections,
        })
    }

    /// Record a completed request.
    pub fn record_request(
        &self,
        method: &str,
        route: &str,
        status: u16,
        service: &str,
        elapsed: Duration,
    ) {
        let status = status.to_string();
        let labels = [method, route, status.as_str(), service];
        self.http_requests.with_label_values(&labels).inc();
        self.http_duration
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    /// Record a gateway-generated error response.
    pub fn record_error(&self, method: &str, route: &str, error_type: &str, service: &str) {
        self.http_errors
            .with_label_values(&[method, route, error_type, service])
            .inc();
    }

    /// Record a backend call that produced a response.
    pub fn record_proxy(&self, service: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.proxy_requests
            .with_label_values(&[service, status.as_str()])
            .inc();
        self.proxy_duration
            .with_label_values(&[service])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a backend call that failed before any response.
    pub fn record_proxy_failure(&self, service: &str, elapsed: Duration) {
        self.proxy_requests
            .with_label_values(&[service, "error"])
            .inc();
        self.proxy_duration
            .with_label_values(&[service])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_breaker_state(&self, service: &str, state: CircuitState) {
        self.breaker_state
            .with_label_values(&[service])
            .set(state.as_gauge());
    }

    pub fn set_service_health(&self, service: &str, status: HealthStatus) {
        self.service_health
            .with_label_values(&[service])
            .set(status.as_gauge());
    }

    pub fn record_rate_limited(&self, route: &str) {
        self.rate_limit_exceeded.with_label_values(&[route]).inc();
    }

    pub fn record_auth_failure(&self, route: &str, reason: &str) {
        self.auth_failures.with_label_values(&[route, reason]).inc();
    }

    pub fn connection_opened(&self) {
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.get()
    }

    /// Text exposition of every registered family.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
