//! Per-service circuit breakers.
//!
//! One breaker exists per registered backend for the life of the process.
//! Each breaker guards its own state with its own lock, so traffic to one
//! service never contends with another.
//!
//! # Circuit Breaker States
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    CIRCUIT BREAKER STATE MACHINE                    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │      ┌──────────┐  ratio ≥ P%  ┌──────────┐  timeout  ┌──────────┐  │
//! │      │  CLOSED  │ ───────────► │   OPEN   │ ────────► │HALF-OPEN │  │
//! │      │ (normal) │  volume ≥ V  │ (reject) │           │ (trial)  │  │
//! │      └──────────┘              └──────────┘ ◄──────── └──────────┘  │
//! │            ▲                                 failure       │        │
//! │            └───────────────────────────────────────────────┘        │
//! │                              success                                │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Counting
//!
//! Outcomes land in a rolling window split into fixed buckets
//! (`rolling_window / rolling_buckets` each). Only buckets younger than the
//! window count toward the volume and failure ratio. The ratio is evaluated
//! after every outcome recorded while Closed.
//!
//! # Cancellation
//!
//! Calls made through a [`BreakerPermit`] that is dropped without an outcome
//! (client went away) free their trial slot and count as neither success nor
//! failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::ser::SerializeStruct;
use tracing::{debug, info, warn};

use crate::domain::config::BreakerSettings;
use crate::domain::types::ServiceDescriptor;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit is open - requests are rejected immediately
    Open,
    /// Testing if service is healthy - allows limited requests
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open.
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    epoch: u64,
    successes: u32,
    failures: u32,
}

/// Bucketed rolling window of outcomes.
#[derive(Debug)]
struct RollingWindow {
    buckets: Vec<Bucket>,
    bucket_len: Duration,
    origin: Instant,
}

impl RollingWindow {
    fn new(window: Duration, buckets: u32, origin: Instant) -> Self {
        let buckets = buckets.max(1);
        let bucket_len = (window / buckets).max(Duration::from_millis(1));
        Self {
            buckets: vec![Bucket::default(); buckets as usize],
            bucket_len,
            origin,
        }
    }

    fn epoch(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.origin).as_nanos() / self.bucket_len.as_nanos()) as u64
    }

    fn current(&mut self, now: Instant) -> &mut Bucket {
        let epoch = self.epoch(now);
        let len = self.buckets.len() as u64;
        let bucket = &mut self.buckets[(epoch % len) as usize];
        if bucket.epoch != epoch {
            *bucket = Bucket {
                epoch,
                ..Bucket::default()
            };
        }
        bucket
    }

    fn record(&mut self, success: bool, now: Instant) {
        let bucket = self.current(now);
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
    }

    /// (successes, failures) within the window ending at `now`.
    fn totals(&self, now: Instant) -> (u32, u32) {
        let epoch = self.epoch(now);
        let len = self.buckets.len() as u64;
        self.buckets
            .iter()
            .filter(|b| b.epoch <= epoch && epoch - b.epoch < len)
            .fold((0, 0), |(s, f), b| (s + b.successes, f + b.failures))
    }

    fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = Bucket::default());
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    last_transition: Instant,
    /// Bumped on every transition; stale permits only touch the window
    generation: u64,
    trials_in_flight: u32,
    total_requests: u64,
    total_failures: u64,
    total_rejected: u64,
}

/// Admission token returned by [`CircuitBreaker::try_acquire`].
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unsettled releases the slot without recording an outcome.
#[must_use = "a permit must be settled or dropped"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is a HalfOpen trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, Some(true), Instant::now());
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, Some(false), Instant::now());
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.generation, None, Instant::now());
        }
    }
}

/// Breaker guarding one backend service.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let now = Instant::now();
        let window = RollingWindow::new(settings.rolling_window, settings.rolling_buckets, now);
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                last_transition: now,
                generation: 0,
                trials_in_flight: 0,
                total_requests: 0,
                total_failures: 0,
                total_rejected: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Whether a new call may proceed.
    ///
    /// Performs the Open to HalfOpen transition once the trip timeout has
    /// elapsed. In HalfOpen, at most `half_open_max_trials` calls are
    /// admitted until one of them reports an outcome.
    pub fn allow(&self) -> bool {
        self.admit(Instant::now()).is_some()
    }

    /// Like [`allow`](Self::allow), returning a permit that records the
    /// outcome of this specific call.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        self.admit(Instant::now()).map(|(generation, trial)| BreakerPermit {
            breaker: self,
            generation,
            trial,
            settled: false,
        })
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.apply(&mut inner, true, now);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.apply(&mut inner, false, now);
    }

    /// Force Closed and clear every counter.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        info!(service = %self.name, from = %inner.state, "Circuit breaker manually reset");
        self.transition(&mut inner, CircuitState::Closed, now);
        inner.total_requests = 0;
        inner.total_failures = 0;
        inner.total_rejected = 0;
    }

    /// Current state; never mutates.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let now = Instant::now();
        let inner = self.inner.lock();
        let (window_successes, window_failures) = inner.window.totals(now);
        CircuitStats {
            service: self.name.clone(),
            state: inner.state,
            window_successes,
            window_failures,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_rejected: inner.total_rejected,
            time_in_state_ms: now
                .saturating_duration_since(inner.last_transition)
                .as_millis() as u64,
        }
    }

    fn admit(&self, now: Instant) -> Option<(u64, bool)> {
        let mut inner = self.inner.lock();
        let admitted = match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(self.settings.timeout);
                if elapsed >= self.settings.timeout {
                    info!(service = %self.name, "Circuit breaker transitioning to half-open");
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.trials_in_flight = 1;
                    Some(true)
                } else {
                    debug!(
                        service = %self.name,
                        remaining_ms = (self.settings.timeout - elapsed).as_millis() as u64,
                        "Circuit breaker is open, rejecting request"
                    );
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_in_flight < self.settings.half_open_max_trials {
                    inner.trials_in_flight += 1;
                    Some(true)
                } else {
                    debug!(service = %self.name, "Half-open trial slots busy, rejecting request");
                    None
                }
            }
        };

        match admitted {
            Some(trial) => {
                inner.total_requests += 1;
                Some((inner.generation, trial))
            }
            None => {
                inner.total_rejected += 1;
                None
            }
        }
    }

    fn settle(&self, generation: u64, outcome: Option<bool>, now: Instant) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            // Admitted before the last transition.
            if let (Some(success), CircuitState::Closed) = (outcome, inner.state) {
                self.apply(&mut inner, success, now);
            }
            return;
        }
        match outcome {
            Some(success) => self.apply(&mut inner, success, now),
            None => {
                if inner.state == CircuitState::HalfOpen {
                    inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                }
                debug!(service = %self.name, "Call cancelled, outcome not recorded");
            }
        }
    }

    fn apply(&self, inner: &mut BreakerInner, success: bool, now: Instant) {
        if !success {
            inner.total_failures += 1;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.window.record(success, now);
                let (successes, failures) = inner.window.totals(now);
                let volume = successes + failures;
                if volume >= self.settings.volume_threshold
                    && failures as u64 * 100
                        >= self.settings.error_threshold_percentage as u64 * volume as u64
                {
                    warn!(
                        service = %self.name,
                        failures,
                        volume,
                        threshold_pct = self.settings.error_threshold_percentage,
                        timeout_ms = self.settings.timeout.as_millis() as u64,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    info!(service = %self.name, "Circuit breaker closing after successful trial");
                    self.transition(inner, CircuitState::Closed, now);
                } else {
                    warn!(service = %self.name, "Circuit breaker reopening after trial failure");
                    self.transition(inner, CircuitState::Open, now);
                }
            }
            CircuitState::Open => {
                // Late outcome of a call admitted before tripping.
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        inner.state = to;
        inner.generation += 1;
        inner.last_transition = now;
        inner.trials_in_flight = 0;
        inner.window.clear();
        inner.opened_at = (to == CircuitState::Open).then_some(now);
    }

    #[cfg(test)]
    fn allow_at(&self, now: Instant) -> bool {
        self.admit(now).is_some()
    }
}

/// Statistics for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub service: String,
    pub state: CircuitState,
    pub window_successes: u32,
    pub window_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub time_in_state_ms: u64,
}

impl serde::Serialize for CircuitStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("CircuitStats", 8)?;
        state.serialize_field("service", &self.service)?;
        state.serialize_field("state", &self.state.to_string())?;
        state.serialize_field("windowSuccesses", &self.window_successes)?;
        state.serialize_field("windowFailures", &self.window_failures)?;
        state.serialize_field("totalRequests", &self.total_requests)?;
        state.serialize_field("totalFailures", &self.total_failures)?;
        state.serialize_field("totalRejected", &self.total_rejected)?;
        state.serialize_field("timeInStateMs", &self.time_in_state_ms)?;
        state.end()
    }
}

/// Service configuration plus live breaker statistics.
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub name: String,
    pub url: String,
    pub timeout: Duration,
    pub breaker: BreakerSettings,
    pub circuit: CircuitStats,
}

impl serde::Serialize for ServiceStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("ServiceStats", 8)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("url", &self.url)?;
        state.serialize_field("circuitBreakerState", &self.circuit.state.to_string())?;
        state.serialize_field("timeoutMs", &(self.timeout.as_millis() as u64))?;
        state.serialize_field("breakerTimeoutMs", &(self.breaker.timeout.as_millis() as u64))?;
        state.serialize_field(
            "errorThresholdPercentage",
            &self.breaker.error_threshold_percentage,
        )?;
        state.serialize_field("volumeThreshold", &self.breaker.volume_threshold)?;
        state.serialize_field("circuit", &self.circuit)?;
        state.end()
    }
}

/// Read-only map from service name to its descriptor and breaker.
///
/// Built once at startup; the map itself is never mutated, only the
/// breakers' internal state.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    services: Vec<ServiceDescriptor>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        let breakers = services
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    Arc::new(CircuitBreaker::new(s.name.clone(), s.breaker.clone())),
                )
            })
            .collect();
        Self { services, breakers }
    }

    pub fn get(&self, service: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(service)
    }

    pub fn descriptor(&self, service: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == service)
    }

    /// Descriptors in configuration order
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Reset one breaker. Returns `false` for an unknown service.
    pub fn reset(&self, service: &str) -> bool {
        match self.breakers.get(service) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Stats for every service, in configuration order.
    pub fn stats(&self) -> Vec<ServiceStats> {
        self.services
            .iter()
            .filter_map(|s| {
                self.breakers.get(&s.name).map(|breaker| ServiceStats {
                    name: s.name.clone(),
                    url: s.base_url.clone(),
                    timeout: s.timeout,
                    breaker: s.breaker.clone(),
                    circuit: breaker.stats(),
                })
            })
            .collect()
    }
}
