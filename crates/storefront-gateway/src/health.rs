//! Health aggregation across backend services.
//!
//! One concurrent probe per service, each bounded by that service's timeout,
//! so the whole fan-out finishes within the slowest configured timeout.

use axum::http::StatusCode;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::domain::types::{HealthReport, HealthStatus, ServiceDescriptor, ServiceHealth};
use crate::middleware::metrics::GatewayMetrics;
use crate::ports::outbound::{BackendClient, BackendError};

/// Probes every registered service and builds a [`HealthReport`].
///
/// Read-only with respect to routing and breaker state.
#[derive(Clone)]
pub struct HealthAggregator {
    client: Arc<dyn BackendClient>,
    services: Arc<[ServiceDescriptor]>,
    probe_path: String,
    metrics: Arc<GatewayMetrics>,
}

impl HealthAggregator {
    pub fn new(
        client: Arc<dyn BackendClient>,
        services: Vec<ServiceDescriptor>,
        probe_path: impl Into<String>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            client,
            services: services.into(),
            probe_path: probe_path.into(),
            metrics,
        }
    }

    /// Probe all services concurrently. Always returns one entry per service.
    ///
    /// Probes run on the calling task, so dropping the returned future
    /// cancels every probe still in flight.
    pub async fn check_all(&self) -> HealthReport {
        let probes = self.services.iter().map(|service| async move {
            let url = format!("{}{}", service.base_url, self.probe_path);
            let outcome = probe(self.client.as_ref(), &url, service.timeout).await;
            (service.name.clone(), outcome)
        });

        let entries = join_all(probes)
            .await
            .into_iter()
            .map(|(service, (status, latency, error))| {
                self.metrics.set_service_health(&service, status);
                ServiceHealth {
                    service,
                    status,
                    latency_ms: latency.as_millis() as u64,
                    last_check: Utc::now(),
                    error,
                }
            });

        let report = HealthReport::from_entries(entries);
        debug!(status = ?report.status, services = report.len(), "Health aggregated");
        report
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }
}

/// Single probe: 200 is healthy, any other status degraded, no answer
/// within `timeout` unhealthy.
async fn probe(
    client: &dyn BackendClient,
    url: &str,
    timeout: Duration,
) -> (HealthStatus, Duration, Option<String>) {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, client.probe(url, timeout))
        .await
        .unwrap_or(Err(BackendError::Timeout(timeout)));
    let latency = started.elapsed();

    match outcome {
        Ok(StatusCode::OK) => (HealthStatus::Healthy, latency, None),
        Ok(status) => (
            HealthStatus::Degraded,
            latency,
            Some(format!("unexpected status {}", status.as_u16())),
        ),
        Err(e) => (HealthStatus::Unhealthy, latency, Some(e.to_string())),
    }
}

/// Periodically refresh the `service_health` gauges, logging status changes.
pub async fn health_refresh_task(aggregator: HealthAggregator, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut previous: Option<HealthStatus> = None;

    loop {
        ticker.tick().await;
        let report = aggregator.check_all().await;
        if previous != Some(report.status) {
            match report.status {
                HealthStatus::Healthy => info!("All backend services healthy"),
                status => {
                    let failing: Vec<&str> = report
                        .services
                        .values()
                        .filter(|s| s.status != HealthStatus::Healthy)
                        .map(|s| s.service.as_str())
                        .collect();
                    warn!(?status, ?failing, "Backend health changed");
                }
            }
            previous = Some(report.status);
        }
    }
}
