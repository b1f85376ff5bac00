//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory. A definition is immutable once a run binds to it; runs hold it
//! behind an `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::RetryPolicy;

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// What a node does when it runs. Each variant has exactly one handler in
/// the step executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Invoke an action from the capability registry with the resolved inputs.
    ActionCall { action_id: String },
    /// Evaluate a boolean expression; output is `{ "result": bool }`.
    Condition { expression: String },
    /// Wait, then pass the resolved inputs through as output.
    Delay { duration_ms: u64 },
    /// Hand a script to the registry's script runner.
    Script { language: String, source: String },
}

impl NodeKind {
    /// Stable label used in logs and step records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ActionCall { .. } => "action_call",
            Self::Condition { .. } => "condition",
            Self::Delay { .. } => "delay",
            Self::Script { .. } => "script",
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Input bindings; strings may be minijinja templates such as
    /// `{{ steps.fetch.output.balance }}`.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Overrides the engine-wide registry call timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the engine-wide retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            inputs: Map::new(),
            timeout_ms: None,
            retry: None,
        }
    }

    pub fn action(id: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::ActionCall { action_id: action_id.into() })
    }

    pub fn delay(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(id, NodeKind::Delay { duration_ms })
    }

    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Condition { expression: expression.into() })
    }

    pub fn script(id: impl Into<String>, language: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Script {
                language: language.into(),
                source: source.into(),
            },
        )
    }

    /// Add one input binding.
    pub fn input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// Boolean expression; when it evaluates false the edge is blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    pub fn guarded(from: impl Into<String>, to: impl Into<String>, guard: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Some(guard.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// A run-scoped variable declared by the definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default)]
    pub default: Value,
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            nodes,
            edges,
            variables: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, default: Value) -> Self {
        self.variables.push(VariableDecl {
            name: name.into(),
            default,
        });
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Declared defaults overlaid with `supplied`.
    pub fn initial_variables(&self, supplied: Map<String, Value>) -> Map<String, Value> {
        let mut vars: Map<String, Value> = self
            .variables
            .iter()
            .map(|v| (v.name.clone(), v.default.clone()))
            .collect();
        vars.extend(supplied);
        vars
    }
}
