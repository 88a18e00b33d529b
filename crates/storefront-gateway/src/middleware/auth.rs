//! Bearer credential verification and role checks.
//!
//! Tokens are HS256 JWTs carrying `{userId, email, role, iat?, exp}`.
//!
//! | requirement | no token | bad token | good token |
//! |-------------|----------|-----------|------------|
//! | none        | pass     | pass      | pass, no principal |
//! | optional    | pass     | pass      | principal attached |
//! | required    | 401      | 401       | principal attached |
//!
//! A non-empty role set then demands a principal (401 otherwise) whose role
//! is in the set (403 otherwise).

use axum::http::{header, HeaderMap};
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::config::AuthConfig;
use crate::domain::error::ApiError;
use crate::domain::types::{AuthRequirement, Principal, Role};

/// JWT claims issued by the auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    pub exp: i64,
}

impl Claims {
    /// Claims for `principal` valid for `ttl_secs` from now.
    pub fn for_principal(principal: &Principal, ttl_secs: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            user_id: principal.id.clone(),
            email: principal.email.clone(),
            role: principal.role,
            iat: Some(now),
            exp: now + ttl_secs,
        }
    }
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Principal {
            id: claims.user_id,
            email: claims.email,
            role: claims.role,
        }
    }
}

/// Credential verification errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("no bearer token")]
    Missing,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("route requires an authenticated principal")]
    PrincipalRequired,
    #[error("role {0} not permitted")]
    Forbidden(Role),
}

impl AuthError {
    /// Metrics label
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing_token",
            AuthError::Expired => "expired_token",
            AuthError::Invalid(_) => "invalid_token",
            AuthError::PrincipalRequired => "principal_required",
            AuthError::Forbidden(_) => "insufficient_role",
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Missing => ApiError::missing_token(),
            AuthError::Expired | AuthError::Invalid(_) => ApiError::invalid_token(),
            AuthError::PrincipalRequired => ApiError::authentication_required(),
            AuthError::Forbidden(_) => ApiError::insufficient_permissions(),
        }
    }
}

/// Verifies bearer tokens and enforces route role sets.
pub struct AuthGate {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthGate {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway_secs;
        Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    /// Bearer token from `Authorization`, if any.
    ///
    /// A header with another scheme counts as absent.
    pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Verify signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims.into())
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })
    }

    /// Resolve the principal for a route's requirement.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        requirement: AuthRequirement,
    ) -> Result<Option<Principal>, AuthError> {
        if requirement == AuthRequirement::None {
            return Ok(None);
        }

        let Some(token) = Self::extract_bearer(headers) else {
            return match requirement {
                AuthRequirement::Required => Err(AuthError::Missing),
                _ => Ok(None),
            };
        };

        match self.verify(token) {
            Ok(principal) => {
                debug!(user_id = %principal.id, role = %principal.role, "Token verified");
                Ok(Some(principal))
            }
            Err(e) if requirement == AuthRequirement::Required => Err(e),
            Err(e) => {
                debug!(error = %e, "Discarding invalid optional credential");
                Ok(None)
            }
        }
    }

    /// Enforce `roles` (empty = no restriction).
    pub fn authorize(principal: Option<&Principal>, roles: &[Role]) -> Result<(), AuthError> {
        if roles.is_empty() {
            return Ok(());
        }
        match principal {
            None => Err(AuthError::PrincipalRequired),
            Some(p) if roles.contains(&p.role) => Ok(()),
            Some(p) => Err(AuthError::Forbidden(p.role)),
        }
    }
}
