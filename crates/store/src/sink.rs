//! Persistence contracts.
//!
//! The engine only ever needs [`RunLogSink`]; hosts that also read history
//! back implement [`RunStore`].

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    StoreError,
    models::{StepLog, WorkflowRun},
};

/// Append-only sink the scheduler writes run records and step logs to.
#[async_trait]
pub trait RunLogSink: Send + Sync {
    /// Insert or replace the run record with the same id.
    async fn save_run(&self, run: &WorkflowRun) -> Result<(), StoreError>;

    /// Append one step log. Logs are immutable once written.
    async fn append_step_log(&self, log: &StepLog) -> Result<(), StoreError>;
}

/// Read side of a run store.
#[async_trait]
pub trait RunStore: RunLogSink {
    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError>;

    /// Runs of one definition, most recently started first.
    async fn list_runs(&self, definition_id: Uuid) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Step logs of one run in append order.
    async fn list_step_logs(&self, run_id: Uuid) -> Result<Vec<StepLog>, StoreError>;
}
