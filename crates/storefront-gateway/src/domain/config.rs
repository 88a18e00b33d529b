//! Gateway configuration with validation.
//!
//! Values come from built-in defaults, then an optional JSON file named by
//! `GW_CONFIG`, then the environment overrides listed on
//! [`GatewayConfig::apply_env_overrides`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::router::{default_rules, RouteRule, RouteTarget};

/// Environment variable naming the optional JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "GW_CONFIG";

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP server configuration
    pub http: HttpConfig,
    /// Backend service catalogue
    pub services: Vec<ServiceConfig>,
    /// Breaker settings for services without an override
    pub circuit_breaker: BreakerSettings,
    /// Route table
    pub routes: RoutesConfig,
    /// Rate limiting and slow-down
    pub rate_limit: RateLimitConfig,
    /// Credential verification
    pub auth: AuthConfig,
    /// Health probing
    pub health: HealthConfig,
    /// CORS configuration
    pub cors: CorsConfig,
    /// Upstream HTTP client configuration
    pub proxy: ProxyConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            services: default_services(),
            circuit_breaker: BreakerSettings::default(),
            routes: RoutesConfig::default(),
            rate_limit: RateLimitConfig::default(),
            auth: AuthConfig::default(),
            health: HealthConfig::default(),
            cors: CorsConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load defaults, the optional `GW_CONFIG` file and environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file. Missing sections keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::File(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| ConfigError::File(format!("{}: {e}", path.display())))
    }

    /// Apply environment overrides through `lookup`.
    ///
    /// Recognised variables: `PORT`, `JWT_SECRET`, `<SERVICE>_SERVICE_URL`,
    /// `CIRCUIT_BREAKER_TIMEOUT`, `CIRCUIT_BREAKER_ERROR_THRESHOLD_PERCENTAGE`,
    /// `CIRCUIT_BREAKER_VOLUME_THRESHOLD`, `RATE_LIMIT_WINDOW_MS`,
    /// `RATE_LIMIT_MAX_REQUESTS`, `SLOW_DOWN_WINDOW_MS`,
    /// `SLOW_DOWN_DELAY_AFTER`, `SLOW_DOWN_MAX_DELAY`, `CORS_ORIGIN`.
    /// Millisecond values are plain integers.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.http.port = parse_env("PORT", &port)?;
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(ms) = lookup("CIRCUIT_BREAKER_TIMEOUT") {
            self.circuit_breaker.timeout =
                Duration::from_millis(parse_env("CIRCUIT_BREAKER_TIMEOUT", &ms)?);
        }
        if let Some(pct) = lookup("CIRCUIT_BREAKER_ERROR_THRESHOLD_PERCENTAGE") {
            self.circuit_breaker.error_threshold_percentage =
                parse_env("CIRCUIT_BREAKER_ERROR_THRESHOLD_PERCENTAGE", &pct)?;
        }
        if let Some(volume) = lookup("CIRCUIT_BREAKER_VOLUME_THRESHOLD") {
            self.circuit_breaker.volume_threshold =
                parse_env("CIRCUIT_BREAKER_VOLUME_THRESHOLD", &volume)?;
        }
        if let Some(ms) = lookup("RATE_LIMIT_WINDOW_MS") {
            self.rate_limit.global.window =
                Duration::from_millis(parse_env("RATE_LIMIT_WINDOW_MS", &ms)?);
        }
        if let Some(max) = lookup("RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limit.global.max_requests = parse_env("RATE_LIMIT_MAX_REQUESTS", &max)?;
        }
        if let Some(ms) = lookup("SLOW_DOWN_WINDOW_MS") {
            self.rate_limit.slow_down.window =
                Duration::from_millis(parse_env("SLOW_DOWN_WINDOW_MS", &ms)?);
        }
        if let Some(after) = lookup("SLOW_DOWN_DELAY_AFTER") {
            self.rate_limit.slow_down.delay_after = parse_env("SLOW_DOWN_DELAY_AFTER", &after)?;
        }
        if let Some(ms) = lookup("SLOW_DOWN_MAX_DELAY") {
            self.rate_limit.slow_down.max_delay =
                Duration::from_millis(parse_env("SLOW_DOWN_MAX_DELAY", &ms)?);
        }
        if let Some(origins) = lookup("CORS_ORIGIN") {
            self.cors.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        for service in &mut self.services {
            let key = format!("{}_SERVICE_URL", service.name.to_ascii_uppercase());
            if let Some(url) = lookup(&key) {
                service.url = url;
            }
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::InvalidService("no services configured".into()));
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
            if !(service.url.starts_with("http://") || service.url.starts_with("https://")) {
                return Err(ConfigError::InvalidService(format!(
                    "{}: base url must be http(s), got {:?}",
                    service.name, service.url
                )));
            }
            if service.timeout.is_zero() {
                return Err(ConfigError::InvalidTimeout(format!(
                    "{}: timeout cannot be 0",
                    service.name
                )));
            }
            self.breaker_for(service).validate(&service.name)?;
        }

        self.circuit_breaker.validate("default")?;

        self.rate_limit.global.validate("global")?;
        for (name, policy) in &self.rate_limit.policies {
            policy.validate(name)?;
        }
        if self.rate_limit.slow_down.window.is_zero() {
            return Err(ConfigError::InvalidRateLimit(
                "slow_down window cannot be 0".into(),
            ));
        }

        for rule in &self.routes.rules {
            let targets: Vec<&str> = match &rule.target {
                RouteTarget::Service(name) => vec![name.as_str()],
                RouteTarget::Dispatch { rules, .. } => {
                    rules.iter().map(|d| d.service.as_str()).collect()
                }
            };
            for target in targets {
                if !names.contains(target) {
                    return Err(ConfigError::UnknownService {
                        route: rule.prefix.clone(),
                        service: target.to_string(),
                    });
                }
            }
            if !self.rate_limit.policies.contains_key(&rule.policy) {
                return Err(ConfigError::UnknownPolicy {
                    route: rule.prefix.clone(),
                    policy: rule.policy.clone(),
                });
            }
        }

        if self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid("jwt_secret cannot be empty".into()));
        }

        if self.http.max_body_size == 0 {
            return Err(ConfigError::Invalid("max_body_size cannot be 0".into()));
        }

        Ok(())
    }

    /// Breaker settings effective for `service`.
    pub fn breaker_for<'a>(&'a self, service: &'a ServiceConfig) -> &'a BreakerSettings {
        service.circuit_breaker.as_ref().unwrap_or(&self.circuit_breaker)
    }

    /// Get HTTP server bind address
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.http.host, self.http.port)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address
    pub host: IpAddr,
    /// Port (default: 3000)
    pub port: u16,
    /// Serve `GET /metrics`
    pub metrics_enabled: bool,
    /// Max request body size in bytes (default: 10 MiB)
    pub max_body_size: usize,
    /// Include internal error detail in 500 responses (development only)
    pub expose_internal_errors: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 3000,
            metrics_enabled: true,
            max_body_size: 10 * 1024 * 1024,
            expose_internal_errors: false,
        }
    }
}

/// One backend service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name
    pub name: String,
    /// Base URL, e.g. `http://localhost:3003`
    pub url: String,
    /// Per-call timeout for proxying and probing
    #[serde(with = "humantime_serde", default = "default_service_timeout")]
    pub timeout: Duration,
    /// Breaker override; falls back to the top-level `circuit_breaker`
    #[serde(default)]
    pub circuit_breaker: Option<BreakerSettings>,
}

impl ServiceConfig {
    /// Service with default timeout and breaker settings.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout: default_service_timeout(),
            circuit_breaker: None,
        }
    }
}

fn default_service_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_services() -> Vec<ServiceConfig> {
    [
        ("auth", 3001),
        ("user", 3002),
        ("product", 3003),
        ("order", 3004),
        ("payment", 3005),
        ("notification", 3006),
        ("review", 3007),
        ("search", 3008),
        ("shipping", 3009),
    ]
    .into_iter()
    .map(|(name, port)| ServiceConfig::new(name, format!("http://localhost:{port}")))
    .collect()
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Time spent Open before a trial call is admitted
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Failure percentage (1..=100) that trips the breaker
    pub error_threshold_percentage: u8,
    /// Minimum calls in the window before the ratio is evaluated
    pub volume_threshold: u32,
    /// Length of the rolling outcome window
    #[serde(with = "humantime_serde")]
    pub rolling_window: Duration,
    /// Number of buckets the rolling window is split into
    pub rolling_buckets: u32,
    /// Concurrent trial calls allowed while HalfOpen
    pub half_open_max_trials: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            error_threshold_percentage: 50,
            volume_threshold: 10,
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            half_open_max_trials: 1,
        }
    }
}

impl BreakerSettings {
    fn validate(&self, owner: &str) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidBreaker(format!(
                "{owner}: timeout cannot be 0"
            )));
        }
        if !(1..=100).contains(&self.error_threshold_percentage) {
            return Err(ConfigError::InvalidBreaker(format!(
                "{owner}: error_threshold_percentage must be within 1..=100"
            )));
        }
        if self.volume_threshold == 0 {
            return Err(ConfigError::InvalidBreaker(format!(
                "{owner}: volume_threshold cannot be 0"
            )));
        }
        if self.rolling_buckets == 0
            || self.rolling_window < Duration::from_millis(self.rolling_buckets as u64)
        {
            return Err(ConfigError::InvalidBreaker(format!(
                "{owner}: rolling_window must allow at least 1ms per bucket"
            )));
        }
        if self.half_open_max_trials == 0 {
            return Err(ConfigError::InvalidBreaker(format!(
                "{owner}: half_open_max_trials cannot be 0"
            )));
        }
        Ok(())
    }
}

/// Route table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// Path prefix all rules are mounted under
    pub mount: String,
    /// Rules, evaluated in order
    pub rules: Vec<RouteRule>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            mount: "/api".to_string(),
            rules: default_rules(),
        }
    }
}

/// How a policy derives its counting key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// One counter per client address, shared by every route using the policy
    Client,
    /// One counter per client address and route
    #[default]
    Route,
}

/// Fixed-window policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests admitted per key per window
    pub max_requests: u32,
    /// Message returned with 429
    #[serde(default = "default_limit_message")]
    pub message: String,
    /// Counting key
    #[serde(default)]
    pub scope: KeyScope,
}

fn default_limit_message() -> String {
    "Too many requests, please try again later.".to_string()
}

impl RateLimitPolicy {
    /// Policy with the given window, maximum and message.
    pub fn new(window: Duration, max_requests: u32, message: impl Into<String>) -> Self {
        Self {
            window,
            max_requests,
            message: message.into(),
            scope: KeyScope::Route,
        }
    }

    pub fn with_scope(mut self, scope: KeyScope) -> Self {
        self.scope = scope;
        self
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::InvalidRateLimit(format!(
                "{name}: window cannot be 0"
            )));
        }
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidRateLimit(format!(
                "{name}: max_requests cannot be 0"
            )));
        }
        Ok(())
    }
}

/// Graduated slow-down configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowDownConfig {
    /// Enable slow-down
    pub enabled: bool,
    /// Counting window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Hits per window admitted without delay
    pub delay_after: u32,
    /// Added delay per hit above `delay_after`
    #[serde(with = "humantime_serde")]
    pub delay_step: Duration,
    /// Upper bound for the added delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for SlowDownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(15 * 60),
            delay_after: 50,
            delay_step: Duration::from_millis(100),
            max_delay: Duration::from_millis(200),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Use the first `X-Forwarded-For` hop as client key
    pub trust_forwarded_for: bool,
    /// Policy applied to every proxied request
    pub global: RateLimitPolicy,
    /// Named policies referenced by route rules
    pub policies: BTreeMap<String, RateLimitPolicy>,
    /// Graduated delay
    pub slow_down: SlowDownConfig,
    /// Interval of the stale-window sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let minutes = |m: u64| Duration::from_secs(m * 60);
        let mut policies = BTreeMap::new();
        policies.insert(
            "auth".to_string(),
            RateLimitPolicy::new(
                minutes(15),
                5,
                "Too many authentication attempts, please try again later.",
            ),
        );
        policies.insert(
            "api".to_string(),
            RateLimitPolicy::new(
                minutes(15),
                1000,
                "API rate limit exceeded, please try again later.",
            ),
        );
        policies.insert(
            "search".to_string(),
            RateLimitPolicy::new(
                minutes(1),
                30,
                "Too many search requests, please try again later.",
            ),
        );
        policies.insert(
            "upload".to_string(),
            RateLimitPolicy::new(
                minutes(60),
                10,
                "Too many upload requests, please try again later.",
            ),
        );

        Self {
            enabled: true,
            trust_forwarded_for: false,
            global: RateLimitPolicy::new(
                minutes(15),
                100,
                "Too many requests from this IP, please try again later.",
            )
            .with_scope(KeyScope::Client),
            policies,
            slow_down: SlowDownConfig::default(),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Credential verification configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret
    pub jwt_secret: String,
    /// Clock skew tolerated on `exp`, in seconds
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "fallback-secret".to_string(),
            leeway_secs: 0,
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

/// Health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Path probed on every service
    pub probe_path: String,
    /// Refresh `service_health` gauges in the background
    pub background_refresh: bool,
    /// Background refresh interval
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_path: "/health".to_string(),
            background_refresh: true,
            refresh_interval: Duration::from_secs(30),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Enable CORS
    pub enabled: bool,
    /// Allowed origins ("*" for all)
    pub allowed_origins: Vec<String>,
    /// Allowed methods
    pub allowed_methods: Vec<String>,
    /// Allowed headers
    pub allowed_headers: Vec<String>,
    /// Expose headers
    pub expose_headers: Vec<String>,
    /// Max age for preflight cache
    pub max_age: u64,
    /// Allow credentials
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            allowed_headers: ["Content-Type", "Authorization", "X-Request-Id"]
                .into_iter()
                .map(String::from)
                .collect(),
            expose_headers: [
                "X-Request-Id",
                "RateLimit-Limit",
                "RateLimit-Remaining",
                "RateLimit-Reset",
                "Retry-After",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_age: 86400,
            allow_credentials: true,
        }
    }
}

/// Upstream HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Idle pooled connection lifetime
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
    /// Idle connections kept per backend host
    pub pool_max_idle_per_host: usize,
    /// Append the client address to `X-Forwarded-For`
    pub forward_client_ip: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
            forward_client_ip: true,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable or malformed
    #[error("config file: {0}")]
    File(String),
    /// Environment variable could not be parsed
    #[error("invalid value {value:?} for {key}")]
    Env { key: String, value: String },
    /// Two services share a name
    #[error("duplicate service name: {0}")]
    DuplicateService(String),
    /// Invalid service entry
    #[error("invalid service: {0}")]
    InvalidService(String),
    /// Invalid breaker thresholds
    #[error("invalid circuit breaker: {0}")]
    InvalidBreaker(String),
    /// Invalid rate limiting configuration
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Route points at a service that is not configured
    #[error("route {route} targets unknown service {service}")]
    UnknownService { route: String, service: String },
    /// Route names a policy that is not configured
    #[error("route {route} uses unknown rate limit policy {policy}")]
    UnknownPolicy { route: String, policy: String },
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Humantime serde module for Duration serialization
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .trim()
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|_| "invalid hours")
        } else {
            // Try parsing as plain seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
