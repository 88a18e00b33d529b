//! Declarative route table.
//!
//! Rules are evaluated top-down against the request path (after removing the
//! mount prefix); the first rule whose prefix matches wins. Prefix matching is
//! segment-aware: `/orders` matches `/orders` and `/orders/42`, never
//! `/ordersummary`. Paths carrying `.` or `..` segments, literal or
//! percent-encoded, match nothing: the backend would see them collapsed into
//! a path another rule governs.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::error::ApiError;
use crate::domain::types::{AuthRequirement, Role};

/// Path transformation applied before forwarding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRewrite {
    /// Forward the mount-relative path unchanged
    None,
    /// Drop the rule prefix
    #[default]
    StripPrefix,
    /// Replace the rule prefix with another prefix
    ReplacePrefix { with: String },
}

impl PathRewrite {
    /// Apply to `path`, whose leading `prefix` has already been matched.
    pub fn apply(&self, prefix: &str, path: &str) -> String {
        let rest = &path[prefix.len().min(path.len())..];
        let rewritten = match self {
            PathRewrite::None => return path.to_string(),
            PathRewrite::StripPrefix => rest.to_string(),
            PathRewrite::ReplacePrefix { with } => {
                format!("{}{}", with.trim_end_matches('/'), rest)
            }
        };
        if rewritten.is_empty() {
            "/".to_string()
        } else {
            rewritten
        }
    }
}

/// Sub-path to service mapping used by dispatching rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRule {
    pub prefix: String,
    pub service: String,
}

/// Where a rule sends matching requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// A single backend service
    Service(String),
    /// Pick a service by the rewritten sub-path
    Dispatch {
        rules: Vec<DispatchRule>,
        #[serde(default)]
        not_found_message: Option<String>,
    },
}

/// One entry of the route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Mount-relative path prefix, e.g. `/orders`
    pub prefix: String,
    /// Allowed methods; empty means any
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub rewrite: PathRewrite,
    pub target: RouteTarget,
    #[serde(default)]
    pub auth: AuthRequirement,
    /// Allowed roles; empty means any principal (or none)
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Rate-limit policy name
    pub policy: String,
}

impl RouteRule {
    /// Rule forwarding to `service` with prefix stripping and no auth.
    pub fn to_service(prefix: &str, service: &str, policy: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            methods: Vec::new(),
            rewrite: PathRewrite::StripPrefix,
            target: RouteTarget::Service(service.to_string()),
            auth: AuthRequirement::None,
            roles: Vec::new(),
            policy: policy.to_string(),
        }
    }

    pub fn with_auth(mut self, auth: AuthRequirement) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_rewrite(mut self, rewrite: PathRewrite) -> Self {
        self.rewrite = rewrite;
        self
    }

    pub fn with_roles(mut self, roles: &[Role]) -> Self {
        self.roles = roles.to_vec();
        self
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        self
    }

    fn allows_method(&self, method: &Method) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub rule: Arc<RouteRule>,
    /// Resolved backend service
    pub service: String,
    /// Path sent to the backend, query excluded
    pub forward_path: String,
}

/// Segment-aware prefix test.
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() || prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// True when some segment is `.` or `..`, literal or percent-encoded.
///
/// Backslashes count as separators, as they do for http URLs.
pub fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Ordered, immutable route table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    mount: String,
    rules: Vec<Arc<RouteRule>>,
}

impl RouteTable {
    pub fn new(mount: &str, rules: Vec<RouteRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|mut rule| {
                rule.prefix = normalize_prefix(&rule.prefix);
                Arc::new(rule)
            })
            .collect();
        Self {
            mount: normalize_prefix(mount),
            rules,
        }
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn rules(&self) -> &[Arc<RouteRule>] {
        &self.rules
    }

    /// Resolve `path` to exactly one rule, or a 404.
    pub fn resolve(&self, method: &Method, path: &str) -> Result<RouteMatch, ApiError> {
        if has_dot_segment(path) || !prefix_matches(&self.mount, path) {
            return Err(ApiError::not_found(path));
        }
        let relative = match &path[self.mount.len()..] {
            "" => "/",
            rest => rest,
        };

        let rule = self
            .rules
            .iter()
            .find(|rule| rule.allows_method(method) && prefix_matches(&rule.prefix, relative))
            .ok_or_else(|| ApiError::not_found(path))?;

        let forward_path = rule.rewrite.apply(&rule.prefix, relative);

        let service = match &rule.target {
            RouteTarget::Service(name) => name.clone(),
            RouteTarget::Dispatch {
                rules,
                not_found_message,
            } => {
                let sub_path = &relative[rule.prefix.len()..];
                rules
                    .iter()
                    .find(|d| prefix_matches(&normalize_prefix(&d.prefix), sub_path))
                    .map(|d| d.service.clone())
                    .ok_or_else(|| ApiError::RouteNotFound {
                        message: not_found_message
                            .clone()
                            .unwrap_or_else(|| "Endpoint not found".to_string()),
                        path: path.to_string(),
                    })?
            }
        };

        Ok(RouteMatch {
            rule: Arc::clone(rule),
            service,
            forward_path,
        })
    }
}

/// The storefront route table.
pub fn default_rules() -> Vec<RouteRule> {
    use AuthRequirement::{None as Public, Optional, Required};

    let dispatch = |prefix: &str, service: &str| DispatchRule {
        prefix: prefix.to_string(),
        service: service.to_string(),
    };

    vec![
        RouteRule::to_service("/auth", "auth", "auth").with_auth(Public),
        RouteRule::to_service("/users", "user", "api").with_auth(Required),
        RouteRule::to_service("/products", "product", "api").with_auth(Optional),
        RouteRule::to_service("/categories", "product", "api")
            .with_auth(Optional)
            .with_rewrite(PathRewrite::ReplacePrefix {
                with: "/categories".into(),
            }),
        RouteRule::to_service("/orders", "order", "api").with_auth(Required),
        RouteRule::to_service("/cart", "order", "api")
            .with_auth(Required)
            .with_rewrite(PathRewrite::ReplacePrefix {
                with: "/cart".into(),
            }),
        RouteRule::to_service("/payments", "payment", "api").with_auth(Required),
        RouteRule::to_service("/notifications", "notification", "api").with_auth(Required),
        RouteRule::to_service("/reviews", "review", "api").with_auth(Optional),
        RouteRule::to_service("/search", "search", "search").with_auth(Public),
        RouteRule::to_service("/shipping", "shipping", "api").with_auth(Required),
        RouteRule {
            prefix: "/admin".into(),
            methods: Vec::new(),
            rewrite: PathRewrite::StripPrefix,
            target: RouteTarget::Dispatch {
                rules: vec![
                    dispatch("/products", "product"),
                    dispatch("/categories", "product"),
                    dispatch("/orders", "order"),
                    dispatch("/users", "user"),
                    dispatch("/payments", "payment"),
                    dispatch("/reviews", "review"),
                    dispatch("/shipping", "shipping"),
                ],
                not_found_message: Some("Admin endpoint not found".into()),
            },
            auth: Required,
            roles: vec![Role::Admin],
            policy: "api".into(),
        },
    ]
}
