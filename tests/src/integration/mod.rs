//! # Integration Flows
//!
//! Each flow starts one gateway on `127.0.0.1:0` in front of mock backends
//! also bound to ephemeral ports.

pub mod fixtures;

mod health_flow;
mod proxy_flow;
mod resilience_flow;
