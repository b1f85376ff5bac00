//! Records the engine emits and a store persists.
//!
//! These are *persistence* models: they carry no scheduling behaviour.
//! Definition types and scheduling live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow run: `pending → running → terminal`, with
/// `running ⇄ paused` in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution mode
// ---------------------------------------------------------------------------

/// Which part of the definition a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every node.
    #[default]
    Full,
    /// The target node and everything it depends on.
    UpTo { node_id: String },
    /// Only the target node.
    Single { node_id: String },
    /// Every node, reusing the completed steps of an earlier run of the
    /// same definition.
    Resume { run_id: Uuid },
}

impl ExecutionMode {
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Full | Self::Resume { .. } => None,
            Self::UpTo { node_id } | Self::Single { node_id } => Some(node_id),
        }
    }
}

// ---------------------------------------------------------------------------
// workflow runs
// ---------------------------------------------------------------------------

/// One execution instance of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub status: RunStatus,
    pub mode: ExecutionMode,
    pub variables: Map<String, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    /// Most recently dispatched node.
    pub current_node_id: Option<String>,
    /// Node whose failure terminated the run, if any.
    pub failed_node_id: Option<String>,
    pub error: Option<String>,
}

impl WorkflowRun {
    /// A fresh run record in `pending`.
    pub fn pending(definition_id: Uuid, mode: ExecutionMode, variables: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_id,
            status: RunStatus::Pending,
            mode,
            variables,
            started_at: None,
            finished_at: None,
            paused_at: None,
            resumed_at: None,
            current_node_id: None,
            failed_node_id: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// step logs
// ---------------------------------------------------------------------------

/// Outcome recorded for a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Immutable record of one node attempt within a run.
///
/// `attempt` is 1-based. Nodes the scheduler settles without running them
/// (skips, guard failures, outputs carried over by a resumed run) are logged
/// once with attempt `0`. `execution_order` numbers nodes in the order the
/// run settled or dispatched them, starting at 1; every attempt of a node
/// shares its number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub node_kind: String,
    pub execution_order: u32,
    pub attempt: u32,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
}
