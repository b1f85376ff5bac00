//! `engine` crate: workflow models, validation, variable resolution and the
//! run scheduler.

pub mod models;
pub mod config;
pub mod error;
pub mod resolver;
mod template;
pub mod expression;
pub mod dag;
pub mod plan;
pub mod events;
pub mod executor;
pub mod scheduler;

pub use models::{Edge, Node, NodeKind, VariableDecl, WorkflowDefinition};
pub use config::{EngineConfig, RetryPolicy};
pub use error::{EngineError, StepError, ValidationError};
pub use resolver::{Scope, UnresolvedReference, resolve};
pub use dag::validate_dag;
pub use plan::ExecutionPlan;
pub use events::{EventBus, EventKind, RunEvent};
pub use executor::{StepContext, StepExecutor, StepOutcome};
pub use scheduler::{NodeState, PreparedRun, RunControls, RunHandle, RunRequest, RunScheduler, RunSummary};
pub use store::ExecutionMode;
