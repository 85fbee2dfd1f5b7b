//! # nbal-core
//!
//! Core crate for the NUMA balancer, providing:
//!
//! - **Types** (`types`) — NUMA node descriptors, group affinity, thread
//!   state / wait-reason diagnostics
//! - **Configuration** (`config`) — JSON settings deserialization
//! - **Error types** (`error`) — domain-specific `BalancerError` via thiserror
//! - **Rolling average** (`ring`) — fixed-window circular mean
//! - **Logging** (`logging`) — tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod ring;
pub mod types;

// Re-export types at crate root for convenience.
pub use types::*;
