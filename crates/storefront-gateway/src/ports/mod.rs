//! Ports (hexagonal boundaries) of the gateway.

pub mod outbound;

pub use outbound::{BackendClient, BackendError, BackendResponse, ForwardRequest};
