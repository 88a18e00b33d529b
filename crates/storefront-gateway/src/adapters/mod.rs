//! Adapters for the gateway.
//!
//! Infrastructure implementations of the outbound ports.

pub mod http_client;

pub use http_client::ReqwestBackendClient;
