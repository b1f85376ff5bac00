//! Engine-level error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::resolver::UnresolvedReference;

/// Structural problems found before a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The definition has no nodes.
    #[error("workflow has no nodes")]
    Empty,

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNode(String),

    /// An edge or reference names a node ID that doesn't exist.
    #[error("{side} references unknown node '{node_id}'")]
    DanglingEdge {
        node_id: String,
        side: &'static str,
    },

    /// The dependency graph is not acyclic.
    #[error("workflow graph contains a cycle through: {}", nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    /// A guard expression on an edge does not parse.
    #[error("guard on edge '{from}' -> '{to}' is malformed: {message}")]
    InvalidGuard {
        from: String,
        to: String,
        message: String,
    },

    /// A condition node's expression does not parse.
    #[error("expression of node '{node_id}' is malformed: {message}")]
    InvalidExpression { node_id: String, message: String },

    /// An input binding contains a malformed template.
    #[error("input '{input}' of node '{node_id}' is malformed: {message}")]
    InvalidBinding {
        node_id: String,
        input: String,
        message: String,
    },

    /// The execution mode targets a node that doesn't exist.
    #[error("execution target '{0}' is not a node of this workflow")]
    UnknownTarget(String),
}

/// Why a single step attempt did not complete.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    /// An input binding referenced something that isn't there.
    #[error(transparent)]
    UnresolvedReference(#[from] UnresolvedReference),

    /// The registry call exceeded the node timeout.
    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    /// Network-style failure reported by the capability.
    #[error("transient execution error: {0}")]
    Transient(String),

    /// Non-retryable failure; halts the run.
    #[error("fatal execution error: {0}")]
    Fatal(String),

    /// The run was cancelled while this step was pending a retry or in flight.
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Only timeouts and transient capability errors are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }
}

impl From<capability::CapabilityError> for StepError {
    fn from(err: capability::CapabilityError) -> Self {
        match err {
            capability::CapabilityError::Transient(msg) => Self::Transient(msg),
            other => Self::Fatal(other.to_string()),
        }
    }
}

/// Errors produced by the workflow engine at run level.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The definition failed validation; the run never started.
    #[error("invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    /// The run record could not be persisted.
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    /// A `resume` request names a run that cannot be resumed.
    #[error("cannot resume run {run_id}: {reason}")]
    Resume { run_id: Uuid, reason: String },

    /// The scheduler task panicked or was aborted.
    #[error("run task failed: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use capability::CapabilityError;

    #[test]
    fn capability_errors_map_onto_retry_classes() {
        assert!(StepError::from(CapabilityError::Transient("rpc reset".into())).is_retryable());
        assert!(!StepError::from(CapabilityError::Fatal("bad abi".into())).is_retryable());
        assert!(!StepError::from(CapabilityError::UnknownAction("nope".into())).is_retryable());
        assert!(StepError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
    }

    #[test]
    fn cycle_message_lists_nodes() {
        let err = ValidationError::Cycle {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "workflow graph contains a cycle through: a, b");
    }
}
