//! Admission pipeline run before a request is proxied.
//!
//! Stages run in order and may short-circuit with an [`ApiError`]:
//!
//! ```text
//! Route ──▶ Auth ──▶ RateLimit ──▶ SlowDown ──▶ (proxy)
//! ```
//!
//! Each stage reads the request head and enriches the [`RequestContext`].

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain::error::ApiError;
use crate::domain::types::RequestContext;
use crate::middleware::auth::AuthGate;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::rate_limit::RateLimiter;
use crate::router::RouteTable;

/// Borrowed view of the incoming request line and headers.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
}

/// Result of one stage.
#[derive(Debug)]
pub enum StageOutcome {
    Continue,
    Respond(ApiError),
}

/// One admission step.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, head: &RequestHead<'_>, ctx: &mut RequestContext) -> StageOutcome;
}

/// Rate-limit key for the context's client.
fn client_key(ctx: &RequestContext) -> String {
    ctx.client_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Resolves the route; 404 when nothing matches.
pub struct RouteStage {
    table: Arc<RouteTable>,
}

impl RouteStage {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl PipelineStage for RouteStage {
    fn name(&self) -> &'static str {
        "route"
    }

    async fn apply(&self, head: &RequestHead<'_>, ctx: &mut RequestContext) -> StageOutcome {
        match self.table.resolve(head.method, head.path) {
            Ok(route) => {
                ctx.route = Some(route);
                StageOutcome::Continue
            }
            Err(e) => StageOutcome::Respond(e),
        }
    }
}

/// Verifies credentials and enforces the route's role set.
pub struct AuthStage {
    gate: Arc<AuthGate>,
    metrics: Arc<GatewayMetrics>,
}

impl AuthStage {
    pub fn new(gate: Arc<AuthGate>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { gate, metrics }
    }
}

#[async_trait]
impl PipelineStage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn apply(&self, head: &RequestHead<'_>, ctx: &mut RequestContext) -> StageOutcome {
        let Some(rule) = ctx.route.as_ref().map(|r| Arc::clone(&r.rule)) else {
            return StageOutcome::Respond(ApiError::UnexpectedFault(
                "auth stage reached without a route".into(),
            ));
        };

        let verdict = self
            .gate
            .authenticate(head.headers, rule.auth)
            .and_then(|principal| {
                AuthGate::authorize(principal.as_ref(), &rule.roles).map(|()| principal)
            });

        match verdict {
            Ok(principal) => {
                ctx.principal = principal;
                StageOutcome::Continue
            }
            Err(e) => {
                self.metrics.record_auth_failure(ctx.route_label(), e.reason());
                debug!(route = ctx.route_label(), reason = e.reason(), "Auth rejected request");
                StageOutcome::Respond(e.into())
            }
        }
    }
}

/// Applies the global and route rate-limit policies.
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    metrics: Arc<GatewayMetrics>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { limiter, metrics }
    }
}

#[async_trait]
impl PipelineStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn apply(&self, _head: &RequestHead<'_>, ctx: &mut RequestContext) -> StageOutcome {
        let Some(policy) = ctx.route.as_ref().map(|r| r.rule.policy.clone()) else {
            return StageOutcome::Continue;
        };
        let client = client_key(ctx);
        match self.limiter.check(&policy, &client, ctx.route_label()) {
            Ok(snapshot) => {
                ctx.rate_limit = snapshot;
                StageOutcome::Continue
            }
            Err(e) => {
                if matches!(e, ApiError::RateLimitExceeded { .. }) {
                    self.metrics.record_rate_limited(ctx.route_label());
                }
                StageOutcome::Respond(e)
            }
        }
    }
}

/// Delays admission for clients above the slow-down threshold.
pub struct SlowDownStage {
    limiter: Arc<RateLimiter>,
}

impl SlowDownStage {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl PipelineStage for SlowDownStage {
    fn name(&self) -> &'static str {
        "slow_down"
    }

    async fn apply(&self, _head: &RequestHead<'_>, ctx: &mut RequestContext) -> StageOutcome {
        let delay = self.limiter.slow_down_delay(&client_key(ctx));
        if delay > Duration::ZERO {
            debug!(delay_ms = delay.as_millis() as u64, "Slowing down client");
            tokio::time::sleep(delay).await;
        }
        StageOutcome::Continue
    }
}

/// Ordered stage list.
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn PipelineStage>>) -> Self {
        Self { stages }
    }

    /// Route → Auth → RateLimit → SlowDown.
    pub fn standard(
        table: Arc<RouteTable>,
        gate: Arc<AuthGate>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self::new(vec![
            Box::new(RouteStage::new(table)),
            Box::new(AuthStage::new(gate, Arc::clone(&metrics))),
            Box::new(RateLimitStage::new(Arc::clone(&limiter), metrics)),
            Box::new(SlowDownStage::new(limiter)),
        ])
    }

    /// Run every stage until one responds.
    pub async fn run(&self, head: &RequestHead<'_>, ctx: &mut RequestContext) -> Result<(), ApiError> {
        for stage in &self.stages {
            if let StageOutcome::Respond(e) = stage.apply(head, ctx).await {
                debug!(
                    stage = stage.name(),
                    request_id = %ctx.request_id(),
                    error = %e,
                    "Request rejected"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}
