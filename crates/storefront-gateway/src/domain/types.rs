//! Core domain types shared by the pipeline, proxy and health modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::config::{BreakerSettings, GatewayConfig};
use super::correlation::RequestId;
use crate::router::RouteMatch;

/// Roles a principal may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Admin,
    Moderator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Admin => "admin",
            Role::Moderator => "moderator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Role::Customer),
            "admin" => Ok(Role::Admin),
            "moderator" => Ok(Role::Moderator),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Authenticated identity derived from a verified credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub role: Role,
}

/// Credential requirement declared by a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRequirement {
    /// Credentials are ignored
    #[default]
    None,
    /// A valid credential attaches a principal; absence or invalidity is fine
    Optional,
    /// A valid credential is mandatory
    Required,
}

/// Immutable description of one backend service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Base URL without trailing slash
    pub base_url: String,
    pub timeout: Duration,
    pub breaker: BreakerSettings,
}

impl ServiceDescriptor {
    /// Descriptors for every configured service, in configuration order.
    pub fn from_config(config: &GatewayConfig) -> Vec<ServiceDescriptor> {
        config
            .services
            .iter()
            .map(|service| ServiceDescriptor {
                name: service.name.clone(),
                base_url: service.url.trim_end_matches('/').to_string(),
                timeout: service.timeout,
                breaker: config.breaker_for(service).clone(),
            })
            .collect()
    }
}

/// Rate-limit outcome recorded for response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

/// Per-request state threaded through the pipeline.
///
/// Created at request entry, dropped when the response is sent.
#[derive(Debug)]
pub struct RequestContext {
    request_id: RequestId,
    pub principal: Option<Principal>,
    pub route: Option<RouteMatch>,
    pub client_ip: Option<IpAddr>,
    pub rate_limit: Option<RateLimitSnapshot>,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(request_id: RequestId, client_ip: Option<IpAddr>) -> Self {
        Self {
            request_id,
            principal: None,
            route: None,
            client_ip,
            rate_limit: None,
            started: Instant::now(),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Metrics label for the matched route, or `unmatched`.
    pub fn route_label(&self) -> &str {
        self.route
            .as_ref()
            .map(|r| r.rule.prefix.as_str())
            .unwrap_or("unmatched")
    }

    /// Target service name, if a route matched.
    pub fn service_label(&self) -> &str {
        self.route
            .as_ref()
            .map(|r| r.service.as_str())
            .unwrap_or("gateway")
    }
}

/// Outcome classification of one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge encoding: 0 healthy, 1 degraded, 2 unhealthy.
    pub fn as_gauge(&self) -> i64 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

/// Probe result for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    /// Measured latency in milliseconds
    #[serde(rename = "responseTime")]
    pub latency_ms: u64,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Composite health view, rebuilt on every aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst-case summary of `services`
    pub status: HealthStatus,
    pub services: BTreeMap<String, ServiceHealth>,
}

impl HealthReport {
    pub fn from_entries(entries: impl IntoIterator<Item = ServiceHealth>) -> Self {
        let services: BTreeMap<String, ServiceHealth> = entries
            .into_iter()
            .map(|entry| (entry.service.clone(), entry))
            .collect();
        let status = Self::summarize(services.values().map(|s| s.status));
        Self { status, services }
    }

    /// Healthy if every entry is healthy, unhealthy if every entry is
    /// unhealthy, degraded otherwise. An empty report is healthy.
    fn summarize(statuses: impl Iterator<Item = HealthStatus>) -> HealthStatus {
        let (mut total, mut healthy, mut unhealthy) = (0usize, 0usize, 0usize);
        for status in statuses {
            total += 1;
            match status {
                HealthStatus::Healthy => healthy += 1,
                HealthStatus::Unhealthy => unhealthy += 1,
                HealthStatus::Degraded => {}
            }
        }
        if healthy == total {
            HealthStatus::Healthy
        } else if unhealthy == total {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, service: &str) -> Option<&ServiceHealth> {
        self.services.get(service)
    }
}
