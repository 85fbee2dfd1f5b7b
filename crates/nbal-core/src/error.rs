//! Typed error definitions for the NUMA balancer.
//!
//! Provides [`BalancerError`] for domain-specific errors that are more
//! informative than plain `anyhow::Error` strings. All variants implement
//! `std::error::Error` via `thiserror`, so they integrate seamlessly with
//! `anyhow::Result` in the driver.

use thiserror::Error;

/// Domain-specific errors for the NUMA balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// NUMA topology discovery error.
    #[error("topology error: {0}")]
    Topology(String),

    /// Process snapshot query or decode error.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Performance-counter query error.
    #[error("counter error: {0}")]
    Counter(String),

    /// Thread- or process-level affinity query/set error.
    #[error("affinity error: {0}")]
    Affinity(String),

    /// The OS rejected a handle open or query for lack of privilege.
    ///
    /// Distinguished from the other variants because it drives the one-shot
    /// debug-privilege escalation retry in the sampler.
    #[error("access denied")]
    AccessDenied,

    /// An optional OS capability is absent on this host.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Raw OS error code from a native call.
    #[error("os error {code}: {context}")]
    Os { code: i32, context: String },
}

impl BalancerError {
    /// `true` for failures that the one-time privilege escalation may fix.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, BalancerError::AccessDenied)
    }
}
