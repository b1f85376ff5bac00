//! The capability contracts: what a workflow step can call out to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CapabilityError;

/// Reply of a single capability invocation.
///
/// `success == false` means the action ran and reported a failure of its
/// own (a reverted transaction, a script exiting non-zero, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    /// A successful result carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A failed result with a message from the action itself.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// A single invocable action (chain call, script runner, query, ...).
#[async_trait]
pub trait Action: Send + Sync {
    /// Run the action with the step's resolved input parameters.
    async fn invoke(&self, params: Value) -> Result<ActionResult, CapabilityError>;
}

/// The registry the engine calls for every action-call and script step.
///
/// The engine is agnostic to what sits behind an id; implementations may
/// route to chain SDKs, script runners or anything else.
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    async fn execute(
        &self,
        action_id: &str,
        params: Value,
    ) -> Result<ActionResult, CapabilityError>;
}
