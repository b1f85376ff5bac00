//! Capability-level error type.

use thiserror::Error;

/// Errors returned by a capability registry call.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Transient`: network-style failure; the step is retried with back-off.
/// - `Fatal`: permanent failure; the step fails immediately.
/// - `UnknownAction`: nothing is registered under the requested id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// No action is registered under this id.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// Transient failure; the caller may retry.
    #[error("transient capability error: {0}")]
    Transient(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal capability error: {0}")]
    Fatal(String),
}

impl CapabilityError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
