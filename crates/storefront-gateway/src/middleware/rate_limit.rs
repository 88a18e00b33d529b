//! Fixed-window rate limiting and graduated slow-down.
//!
//! Counters live in a `DashMap`, so increment-and-check for a key happens
//! under that key's shard lock and a counter never passes its maximum.
//! Rejected requests are not counted.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::domain::config::{KeyScope, RateLimitConfig, RateLimitPolicy, SlowDownConfig};
use crate::domain::error::ApiError;
use crate::domain::types::RateLimitSnapshot;

/// Outcome of one limiter check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after: Duration,
    },
    Limited {
        limit: u32,
        retry_after: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    started: Instant,
    hits: u32,
}

impl WindowCounter {
    /// Roll the window forward if it has expired; returns time left.
    fn roll(&mut self, window: Duration, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= window {
            self.started = now;
            self.hits = 0;
            window
        } else {
            window - elapsed
        }
    }
}

/// Per-key fixed-window counter.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Duration,
    max_requests: u32,
    counters: DashMap<String, WindowCounter>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            counters: DashMap::new(),
        }
    }

    /// Count one request for `key` unless the window is exhausted.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter {
                started: now,
                hits: 0,
            });
        let reset_after = counter.roll(self.window, now);

        if counter.hits >= self.max_requests {
            return RateLimitDecision::Limited {
                limit: self.max_requests,
                retry_after: reset_after,
            };
        }
        counter.hits += 1;
        RateLimitDecision::Allowed {
            limit: self.max_requests,
            remaining: self.max_requests - counter.hits,
            reset_after,
        }
    }

    /// Count one request unconditionally; returns hits in the current window.
    pub fn hit_at(&self, key: &str, now: Instant) -> u32 {
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter {
                started: now,
                hits: 0,
            });
        counter.roll(self.window, now);
        counter.hits = counter.hits.saturating_add(1);
        counter.hits
    }

    /// Drop windows that have expired. Returns how many were removed.
    pub fn cleanup(&self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|_, c| now.saturating_duration_since(c.started) < self.window);
        before.saturating_sub(self.counters.len())
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Graduated delay once a key passes `delay_after` hits in the window.
#[derive(Debug)]
pub struct SlowDown {
    config: SlowDownConfig,
    hits: FixedWindowLimiter,
}

impl SlowDown {
    pub fn new(config: SlowDownConfig) -> Self {
        let hits = FixedWindowLimiter::new(config.window, u32::MAX);
        Self { config, hits }
    }

    /// Count a hit for `key` and return the delay it must wait.
    pub fn delay_for(&self, key: &str) -> Duration {
        self.delay_at(key, Instant::now())
    }

    pub fn delay_at(&self, key: &str, now: Instant) -> Duration {
        let hits = self.hits.hit_at(key, now);
        self.delay_for_hits(hits)
    }

    /// `min((hits - delay_after) * step, max_delay)`, zero at or below the threshold.
    pub fn delay_for_hits(&self, hits: u32) -> Duration {
        if hits <= self.config.delay_after {
            return Duration::ZERO;
        }
        let over = hits - self.config.delay_after;
        self.config
            .delay_step
            .saturating_mul(over)
            .min(self.config.max_delay)
    }

    pub fn cleanup(&self, now: Instant) -> usize {
        self.hits.cleanup(now)
    }
}

struct PolicyLimiter {
    policy: RateLimitPolicy,
    limiter: FixedWindowLimiter,
}

impl PolicyLimiter {
    fn new(policy: RateLimitPolicy) -> Self {
        let limiter = FixedWindowLimiter::new(policy.window, policy.max_requests);
        Self { policy, limiter }
    }

    fn key(&self, client: &str, route: &str) -> String {
        match self.policy.scope {
            KeyScope::Client => client.to_string(),
            KeyScope::Route => format!("{client}|{route}"),
        }
    }

    fn check(&self, client: &str, route: &str, now: Instant) -> Result<RateLimitSnapshot, ApiError> {
        match self.limiter.check_at(&self.key(client, route), now) {
            RateLimitDecision::Allowed {
                limit,
                remaining,
                reset_after,
            } => Ok(RateLimitSnapshot {
                limit,
                remaining,
                reset_after,
            }),
            RateLimitDecision::Limited { limit, retry_after } => {
                Err(ApiError::RateLimitExceeded {
                    message: self.policy.message.clone(),
                    limit,
                    retry_after,
                })
            }
        }
    }
}

/// Global and named rate-limit policies plus slow-down.
pub struct RateLimiter {
    enabled: bool,
    trust_forwarded_for: bool,
    global: PolicyLimiter,
    policies: HashMap<String, PolicyLimiter>,
    slow_down: Option<SlowDown>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            trust_forwarded_for: config.trust_forwarded_for,
            global: PolicyLimiter::new(config.global.clone()),
            policies: config
                .policies
                .iter()
                .map(|(name, policy)| (name.clone(), PolicyLimiter::new(policy.clone())))
                .collect(),
            slow_down: config
                .slow_down
                .enabled
                .then(|| SlowDown::new(config.slow_down.clone())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Apply the global policy, then the route's named policy.
    ///
    /// Returns the tighter snapshot for response headers.
    pub fn check(
        &self,
        policy: &str,
        client: &str,
        route: &str,
    ) -> Result<Option<RateLimitSnapshot>, ApiError> {
        if !self.enabled {
            return Ok(None);
        }
        let now = Instant::now();

        let global = self.global.check(client, route, now).inspect_err(|_| {
            warn!(client, route, policy = "global", "Rate limit exceeded");
        })?;

        let named = self.policies.get(policy).ok_or_else(|| {
            ApiError::UnexpectedFault(format!("unknown rate limit policy {policy}"))
        })?;
        let scoped = named.check(client, route, now).inspect_err(|_| {
            warn!(client, route, policy, "Rate limit exceeded");
        })?;

        debug!(
            client,
            policy,
            remaining = scoped.remaining,
            global_remaining = global.remaining,
            "Rate limit check passed"
        );

        Ok(Some(if scoped.remaining <= global.remaining {
            scoped
        } else {
            global
        }))
    }

    /// Slow-down delay for `client`; zero when disabled.
    pub fn slow_down_delay(&self, client: &str) -> Duration {
        match (&self.slow_down, self.enabled) {
            (Some(slow_down), true) => slow_down.delay_for(client),
            _ => Duration::ZERO,
        }
    }

    /// Resolve the counting key for a request.
    pub fn client_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
        client_ip(headers, peer, self.trust_forwarded_for)
    }

    /// Evict expired windows from every counter.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut removed = self.global.limiter.cleanup(now);
        for policy in self.policies.values() {
            removed += policy.limiter.cleanup(now);
        }
        if let Some(slow_down) = &self.slow_down {
            removed += slow_down.cleanup(now);
        }
        removed
    }

    /// Tracked keys across every counter
    pub fn tracked_keys(&self) -> usize {
        self.global.limiter.len()
            + self
                .policies
                .values()
                .map(|p| p.limiter.len())
                .sum::<usize>()
    }
}

/// Client address: first `X-Forwarded-For` hop or `X-Real-IP` when trusted,
/// otherwise the socket peer.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if real_ip.is_some() {
            return real_ip;
        }
    }
    peer.map(|addr| addr.ip())
}

/// Background task evicting stale windows
pub async fn cleanup_task(limiter: Arc<RateLimiter>, interval: Duration) {
    let mut cleanup_interval = tokio::time::interval(interval);
    cleanup_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        cleanup_interval.tick().await;
        let removed = limiter.cleanup();
        if removed > 0 {
            debug!(removed, "Removed stale rate limit windows");
        }
    }
}
