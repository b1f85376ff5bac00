//! `store` crate: the run log sink interface.
//!
//! Defines the run and step-log records the engine emits, the
//! [`RunLogSink`] / [`RunStore`] traits a persistence layer implements, and
//! [`MemoryStore`]. No scheduling logic lives here.

pub mod error;
pub mod models;
pub mod sink;
pub mod memory;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::{ExecutionMode, RunStatus, StepLog, StepStatus, WorkflowRun};
pub use sink::{RunLogSink, RunStore};
