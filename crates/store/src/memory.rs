//! In-memory [`RunStore`], used by tests and the CLI dry-run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{
    RunLogSink, RunStore, StoreError,
    models::{StepLog, WorkflowRun},
};

#[derive(Default)]
struct Tables {
    runs: HashMap<Uuid, WorkflowRun>,
    step_logs: HashMap<Uuid, Vec<StepLog>>,
    written: HashSet<Uuid>,
}

/// Process-local store. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLogSink for MemoryStore {
    async fn save_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        debug!(run_id = %run.id, status = %run.status, "saving run");
        let mut tables = self.tables.write().await;
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn append_step_log(&self, log: &StepLog) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.written.insert(log.id) {
            return Err(StoreError::DuplicateStepLog(log.id));
        }
        tables
            .step_logs
            .entry(log.run_id)
            .or_default()
            .push(log.clone());
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        let tables = self.tables.read().await;
        tables
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {run_id}")))
    }

    async fn list_runs(&self, definition_id: Uuid) -> Result<Vec<WorkflowRun>, StoreError> {
        let tables = self.tables.read().await;
        let mut runs: Vec<WorkflowRun> = tables
            .runs
            .values()
            .filter(|r| r.definition_id == definition_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn list_step_logs(&self, run_id: Uuid) -> Result<Vec<StepLog>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.step_logs.get(&run_id).cloned().unwrap_or_default())
    }
}
