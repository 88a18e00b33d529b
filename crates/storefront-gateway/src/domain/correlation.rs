//! Request id for tracking a call through the gateway and its backends.
//!
//! Generated ids use UUID v7 so they sort by creation time.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest client-supplied id that is accepted verbatim.
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Request id, either client-supplied or generated.
///
/// Immutable once assigned; forwarded to the backend and echoed to the
/// client unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Header carrying the id in both directions
    pub const HEADER: HeaderName = HeaderName::from_static("x-request-id");

    /// Generate a new id (`req_<uuid v7>`)
    pub fn generate() -> Self {
        Self(format!("req_{}", Uuid::now_v7().simple()))
    }

    /// Accept a client-supplied id if it is 1..=128 visible ASCII characters.
    pub fn from_client(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_CLIENT_ID_LEN
            && raw.bytes().all(|b| b.is_ascii_graphic());
        valid.then(|| Self(raw.to_string()))
    }

    /// Resolve from request headers, generating when absent or unusable.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(&Self::HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::from_client)
            .unwrap_or_else(Self::generate)
    }

    /// Borrow the id
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Header value for this id.
    ///
    /// Ids are visible ASCII by construction, so this only fails for ids
    /// deserialized from elsewhere.
    pub fn header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.0).ok()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("req_"));
        assert_eq!(a.as_str().len(), 4 + 32);
    }

    #[test]
    fn test_client_id_accepted() {
        let id = RequestId::from_client("trace-42/abc").unwrap();
        assert_eq!(id.as_str(), "trace-42/abc");
    }

    #[test]
    fn test_client_id_rejected() {
        assert!(RequestId::from_client("").is_none());
        assert!(RequestId::from_client("has space").is_none());
        assert!(RequestId::from_client(&"x".repeat(MAX_CLIENT_ID_LEN + 1)).is_none());
        assert!(RequestId::from_client(&"x".repeat(MAX_CLIENT_ID_LEN)).is_some());
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("client-1"));
        assert_eq!(RequestId::from_headers(&headers).as_str(), "client-1");

        headers.insert("x-request-id", HeaderValue::from_static("bad id"));
        assert!(RequestId::from_headers(&headers).as_str().starts_with("req_"));

        assert!(RequestId::from_headers(&HeaderMap::new())
            .as_str()
            .starts_with("req_"));
    }

    #[test]
    fn test_request_id_serialization() {
        let id = RequestId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
