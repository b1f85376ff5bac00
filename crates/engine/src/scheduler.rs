//! Run scheduling.
//!
//! `RunScheduler` is the central orchestrator:
//! 1. Validates the definition and builds the run's [`ExecutionPlan`].
//! 2. Persists the run record and emits `run:start`.
//! 3. Decides nodes as their dependencies settle (skip or dispatch), running
//!    up to `max_in_flight` steps concurrently on a `JoinSet`.
//! 4. Records step outputs into the run scope, stops dispatching on the first
//!    failure, on cancellation or while paused, and writes the terminal run
//!    record.
//!
//! A run in [`ExecutionMode::Resume`] starts from the completed steps of an
//! earlier run, read back through the scheduler's [`RunStore`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use capability::CapabilityRegistry;
use store::{ExecutionMode, RunLogSink, RunStatus, RunStore, StepLog, StepStatus, WorkflowRun};

use crate::{
    EngineError, StepError,
    config::EngineConfig,
    dag::validate_dag,
    events::{EventBus, RunEvent},
    executor::{StepContext, StepExecutor, StepOutcome},
    models::WorkflowDefinition,
    plan::ExecutionPlan,
    resolver::{Scope, StepOutputs},
};

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Parameters a host supplies when starting a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Overlaid on the definition's declared variable defaults.
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl RunRequest {
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Per-node state within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Final state of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: WorkflowRun,
    pub node_states: BTreeMap<String, NodeState>,
    /// Outputs of every completed node.
    pub outputs: StepOutputs,
}

impl RunSummary {
    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.node_states.get(node_id).copied()
    }
}

// ---------------------------------------------------------------------------
// RunScheduler
// ---------------------------------------------------------------------------

/// Starts runs of workflow definitions.
///
/// One scheduler serves any number of concurrent runs; each run gets its own
/// plan, scope, event bus and cancellation token.
pub struct RunScheduler {
    executor: Arc<StepExecutor>,
    sink: Arc<dyn RunLogSink>,
    history: Option<Arc<dyn RunStore>>,
    config: EngineConfig,
}

impl RunScheduler {
    pub fn new(registry: Arc<dyn CapabilityRegistry>, sink: Arc<dyn RunLogSink>, config: EngineConfig) -> Self {
        Self {
            executor: Arc::new(StepExecutor::new(registry, config.clone())),
            sink,
            history: None,
            config,
        }
    }

    /// Read earlier runs from `store`, enabling [`ExecutionMode::Resume`].
    pub fn with_history(mut self, store: Arc<dyn RunStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `definition` and set up a run without starting it.
    ///
    /// Subscribe to the returned run's bus before calling
    /// [`PreparedRun::start`] to observe every event.
    ///
    /// # Errors
    /// - [`EngineError::Validation`] if the definition or the requested mode
    ///   is invalid.
    /// - [`EngineError::Resume`] / [`EngineError::Store`] if a resume request
    ///   names a run that cannot be read back or resumed.
    ///
    /// Nothing is persisted in either case.
    pub async fn prepare(
        &self,
        definition: Arc<WorkflowDefinition>,
        request: RunRequest,
    ) -> Result<PreparedRun, EngineError> {
        let order = validate_dag(&definition)?;
        let plan = ExecutionPlan::build(definition.clone(), &order, &request.mode)?;

        let (variables, seeded) = match &request.mode {
            ExecutionMode::Resume { run_id } => self.load_prior(&definition, *run_id, request.variables).await?,
            _ => (definition.initial_variables(request.variables), Vec::new()),
        };
        let run = WorkflowRun::pending(definition.id, request.mode, variables);

        Ok(PreparedRun {
            run,
            plan,
            seeded,
            bus: EventBus::new(),
            cancel: CancellationToken::new(),
            executor: self.executor.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
        })
    }

    /// Prepare, start and wait for a run.
    pub async fn run(&self, definition: Arc<WorkflowDefinition>, request: RunRequest) -> Result<RunSummary, EngineError> {
        self.prepare(definition, request).await?.start().await?.wait().await
    }

    /// Variables and completed outputs of the run being resumed. Supplied
    /// variables override the earlier run's.
    async fn load_prior(
        &self,
        definition: &WorkflowDefinition,
        run_id: Uuid,
        overrides: Map<String, Value>,
    ) -> Result<(Map<String, Value>, Vec<(String, Value)>), EngineError> {
        let refuse = |reason: String| EngineError::Resume { run_id, reason };
        let history = self
            .history
            .as_ref()
            .ok_or_else(|| refuse("no run history is configured".into()))?;

        let prior = history.get_run(run_id).await?;
        if prior.definition_id != definition.id {
            return Err(refuse(format!("it belongs to definition {}", prior.definition_id)));
        }
        if !prior.status.is_terminal() {
            return Err(refuse(format!("it is still {}", prior.status)));
        }

        // Later logs win, so a node retried in the earlier run keeps its final output.
        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        for log in history.list_step_logs(run_id).await? {
            if log.status != StepStatus::Completed {
                continue;
            }
            if let Some(output) = log.output {
                outputs.insert(log.node_id, output);
            }
        }
        outputs.retain(|node_id, _| definition.nodes.iter().any(|n| &n.id == node_id));
        info!(%run_id, reused = outputs.len(), "resuming from earlier run");

        let mut variables = prior.variables;
        variables.extend(overrides);
        Ok((variables, outputs.into_iter().collect()))
    }
}

/// A validated run that has not started yet.
pub struct PreparedRun {
    run: WorkflowRun,
    plan: ExecutionPlan,
    /// Outputs carried over from the run being resumed.
    seeded: Vec<(String, Value)>,
    bus: EventBus,
    cancel: CancellationToken,
    executor: Arc<StepExecutor>,
    sink: Arc<dyn RunLogSink>,
    config: EngineConfig,
}

impl PreparedRun {
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Receive every event of this run on a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RunEvent> {
        self.bus.channel()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Persist the run as `running`, emit `run:start` and spawn the dispatch
    /// loop.
    ///
    /// # Errors
    /// [`EngineError::Store`] if the run record cannot be written; the run
    /// does not start.
    pub async fn start(mut self) -> Result<RunHandle, EngineError> {
        self.run.status = RunStatus::Running;
        self.run.started_at = Some(Utc::now());
        if let Err(err) = self.sink.save_run(&self.run).await {
            error!(run_id = %self.run.id, "failed to persist run record: {err}");
            self.bus.close();
            return Err(err.into());
        }

        let run_id = self.run.id;
        self.bus.publish(RunEvent::RunStart {
            run_id,
            definition_id: self.run.definition_id,
        });
        info!(run_id = %run_id, nodes = self.plan.len(), "run started");

        let (pause_tx, pause_rx) = watch::channel(false);
        let controls = RunControls {
            cancel: self.cancel.clone(),
            pause: Arc::new(pause_tx),
        };
        let task = tokio::spawn(RunLoop::new(self).drive(pause_rx));
        Ok(RunHandle { run_id, controls, task })
    }
}

/// Cloneable controls for a started run.
///
/// Pausing is cooperative: the scheduler stops dispatching new steps while
/// in-flight steps run to completion. Once every copy of the controls is
/// dropped, a paused run resumes.
#[derive(Clone)]
pub struct RunControls {
    cancel: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl RunControls {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    /// Whether a pause is currently requested.
    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Handle to a running run.
pub struct RunHandle {
    run_id: Uuid,
    controls: RunControls,
    task: JoinHandle<RunSummary>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn controls(&self) -> RunControls {
        self.controls.clone()
    }

    pub fn cancel(&self) {
        self.controls.cancel();
    }

    pub fn pause(&self) {
        self.controls.pause();
    }

    pub fn resume(&self) {
        self.controls.resume();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.controls.cancellation_token()
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> Result<RunSummary, EngineError> {
        self.task.await.map_err(|e| EngineError::Join(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

enum Wake {
    Joined(Option<Result<(task::Id, StepOutcome), JoinError>>),
    CancelRequested,
    /// `false` once every pause sender is gone.
    PauseChanged(bool),
    GraceExpired,
}

struct RunLoop {
    run: WorkflowRun,
    plan: ExecutionPlan,
    seeded: Vec<(usize, Value)>,
    bus: EventBus,
    cancel: CancellationToken,
    executor: Arc<StepExecutor>,
    sink: Arc<dyn RunLogSink>,
    config: EngineConfig,
    states: Vec<NodeState>,
    /// Unsettled dependencies per node.
    waiting_on: Vec<usize>,
    ready: VecDeque<usize>,
    /// Running steps by the id of the task executing them.
    running: HashMap<task::Id, usize>,
    /// `execution_order` per node; `0` until dispatched or settled.
    orders: Vec<u32>,
    last_order: u32,
    paused: bool,
    scope: Scope,
    /// First failure: node id (if attributable) and message.
    failure: Option<(Option<String>, String)>,
}

impl RunLoop {
    fn new(prepared: PreparedRun) -> Self {
        let PreparedRun {
            run,
            plan,
            seeded,
            bus,
            cancel,
            executor,
            sink,
            config,
        } = prepared;
        let n = plan.len();
        let mut states = vec![NodeState::Pending; n];
        let mut scope = Scope::new(run.variables.clone());
        let seeded: Vec<(usize, Value)> = seeded
            .into_iter()
            .filter_map(|(node_id, output)| {
                let idx = plan.index_of(&node_id)?;
                states[idx] = NodeState::Completed;
                scope.record_output(&node_id, output.clone());
                Some((idx, output))
            })
            .collect();
        let waiting_on = (0..n)
            .map(|i| plan.deps(i).iter().filter(|&&d| states[d] != NodeState::Completed).count())
            .collect();
        Self {
            run,
            plan,
            seeded,
            bus,
            cancel,
            executor,
            sink,
            config,
            states,
            waiting_on,
            ready: VecDeque::new(),
            running: HashMap::new(),
            orders: vec![0; n],
            last_order: 0,
            paused: false,
            scope,
            failure: None,
        }
    }

    fn halted(&self) -> bool {
        self.failure.is_some() || self.cancel.is_cancelled()
    }

    #[instrument(skip(self, pause), fields(run_id = %self.run.id))]
    async fn drive(mut self, mut pause: watch::Receiver<bool>) -> RunSummary {
        for (idx, output) in std::mem::take(&mut self.seeded) {
            let mut log = self.synthetic_log(idx, StepStatus::Completed, None);
            log.output = Some(output);
            self.append(log).await;
        }

        let sources: Vec<usize> = (0..self.plan.len())
            .filter(|&i| self.states[i] == NodeState::Pending && self.waiting_on[i] == 0)
            .collect();
        for idx in sources {
            self.decide(idx).await;
        }

        let mut tasks: JoinSet<StepOutcome> = JoinSet::new();
        let cancel = self.cancel.clone();
        let mut pause_open = true;
        let mut grace_deadline: Option<Instant> = None;
        let mut aborted = false;

        loop {
            if !self.halted() && !self.paused {
                while tasks.len() < self.config.parallelism() {
                    let Some(idx) = self.ready.pop_front() else { break };
                    self.dispatch(idx, &mut tasks);
                }
            }
            if tasks.is_empty() && (self.halted() || self.ready.is_empty()) {
                break;
            }

            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled(), if grace_deadline.is_none() => Wake::CancelRequested,
                changed = pause.changed(), if pause_open => Wake::PauseChanged(changed.is_ok()),
                joined = tasks.join_next_with_id(), if !tasks.is_empty() => Wake::Joined(joined),
                _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() && !aborted => {
                    Wake::GraceExpired
                }
            };

            match wake {
                Wake::Joined(None) => break,
                Wake::Joined(Some(Ok((id, outcome)))) => {
                    if let Some(idx) = self.running.remove(&id) {
                        self.settle(idx, outcome).await;
                    }
                }
                Wake::Joined(Some(Err(err))) => {
                    if let Some(idx) = self.running.remove(&err.id()) {
                        if err.is_cancelled() {
                            self.record_aborted(idx).await;
                        } else {
                            self.record_panicked(idx, &err).await;
                        }
                    }
                }
                Wake::CancelRequested => {
                    info!(in_flight = tasks.len(), "cancellation requested, waiting for in-flight steps");
                    grace_deadline = Some(Instant::now() + self.config.cancel_grace());
                }
                Wake::PauseChanged(open) => {
                    pause_open = open;
                    let requested = open && *pause.borrow_and_update();
                    self.set_paused(requested).await;
                }
                Wake::GraceExpired => {
                    warn!(in_flight = tasks.len(), "grace period elapsed, aborting in-flight steps");
                    tasks.abort_all();
                    aborted = true;
                }
            }
        }

        self.finish().await
    }

    /// The node's `execution_order`, assigned on first use.
    fn order_of(&mut self, idx: usize) -> u32 {
        if self.orders[idx] == 0 {
            self.last_order += 1;
            self.orders[idx] = self.last_order;
        }
        self.orders[idx]
    }

    fn dispatch(&mut self, idx: usize, tasks: &mut JoinSet<StepOutcome>) {
        let node = self.plan.node(idx).clone();
        let ctx = StepContext {
            run_id: self.run.id,
            execution_order: self.order_of(idx),
            scope: self.scope.clone(),
            bus: self.bus.clone(),
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
        };
        let executor = self.executor.clone();

        self.states[idx] = NodeState::Running;
        self.run.current_node_id = Some(node.id.clone());
        let handle = tasks.spawn(async move { executor.execute(&node, ctx).await });
        self.running.insert(handle.id(), idx);
    }

    async fn settle(&mut self, idx: usize, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Completed(output) => {
                self.states[idx] = NodeState::Completed;
                let node_id = self.plan.id(idx).to_owned();
                self.scope.record_output(&node_id, output);
                self.release_dependents(idx).await;
            }
            StepOutcome::Failed(err) => {
                self.states[idx] = NodeState::Failed;
                self.fail(idx, &err);
            }
            StepOutcome::Cancelled => {
                self.states[idx] = NodeState::Cancelled;
            }
        }
    }

    fn fail(&mut self, idx: usize, err: &StepError) {
        let node_id = self.plan.id(idx).to_owned();
        if self.failure.is_none() {
            error!(node_id = %node_id, "node failed, halting run: {err}");
            self.failure = Some((Some(node_id), err.to_string()));
        }
    }

    async fn set_paused(&mut self, paused: bool) {
        if paused == self.paused || self.halted() {
            return;
        }
        self.paused = paused;

        let run_id = self.run.id;
        let now = Utc::now();
        if paused {
            self.run.status = RunStatus::Paused;
            self.run.paused_at = Some(now);
        } else {
            self.run.status = RunStatus::Running;
            self.run.resumed_at = Some(now);
        }
        if let Err(err) = self.sink.save_run(&self.run).await {
            warn!("failed to persist run record: {err}");
        }

        if paused {
            info!(queued = self.ready.len(), "run paused");
            self.bus.publish(RunEvent::RunPaused { run_id });
        } else {
            info!(queued = self.ready.len(), "run resumed");
            self.bus.publish(RunEvent::RunResumed { run_id });
        }
    }

    /// Count `settled` down on each dependent, deciding the ones it frees.
    /// Skips cascade through the same worklist.
    async fn release_dependents(&mut self, settled: usize) {
        let mut worklist = VecDeque::from([settled]);
        while let Some(current) = worklist.pop_front() {
            let dependents = self.plan.dependents(current).to_vec();
            for dep in dependents {
                self.waiting_on[dep] = self.waiting_on[dep].saturating_sub(1);
                if self.waiting_on[dep] == 0 && self.decide(dep).await == NodeState::Skipped {
                    worklist.push_back(dep);
                }
            }
        }
    }

    /// Decide a node whose dependencies are all terminal: queue it, skip it,
    /// or fail it when a guard cannot be evaluated. Returns its new state.
    async fn decide(&mut self, idx: usize) -> NodeState {
        if self.halted() || self.states[idx] != NodeState::Pending {
            return self.states[idx];
        }

        let inbound = self.plan.inbound(idx);
        if inbound.is_empty() {
            self.ready.push_back(idx);
            return self.states[idx];
        }

        let mut satisfied = false;
        let mut guard_error = None;
        for edge in inbound {
            if self.states[edge.from] != NodeState::Completed {
                continue;
            }
            match edge.guard.as_ref().map(|g| g.evaluate(&self.scope)) {
                None | Some(Ok(true)) => {
                    satisfied = true;
                    break;
                }
                Some(Ok(false)) => {}
                Some(Err(err)) => {
                    let from = self.plan.id(edge.from);
                    guard_error = Some(StepError::Fatal(format!("guard on edge from '{from}' failed: {err}")));
                    break;
                }
            }
        }

        if let Some(err) = guard_error {
            self.states[idx] = NodeState::Failed;
            self.record_settled_error(idx, StepStatus::Failed, &err).await;
            self.fail(idx, &err);
        } else if satisfied {
            self.ready.push_back(idx);
        } else {
            self.states[idx] = NodeState::Skipped;
            info!(node_id = %self.plan.id(idx), "every inbound edge is blocked, skipping node");
            let log = self.synthetic_log(idx, StepStatus::Skipped, None);
            self.append(log).await;
        }
        self.states[idx]
    }

    async fn record_aborted(&mut self, idx: usize) {
        self.states[idx] = NodeState::Cancelled;
        self.record_settled_error(idx, StepStatus::Cancelled, &StepError::Cancelled).await;
    }

    async fn record_panicked(&mut self, idx: usize, err: &JoinError) {
        error!(node_id = %self.plan.id(idx), "step task panicked: {err}");
        let err = StepError::Fatal(format!("step task panicked: {err}"));
        self.states[idx] = NodeState::Failed;
        self.record_settled_error(idx, StepStatus::Failed, &err).await;
        self.fail(idx, &err);
    }

    /// Log and report an error the scheduler settled itself, outside any
    /// step attempt.
    async fn record_settled_error(&mut self, idx: usize, status: StepStatus, err: &StepError) {
        let log = self.synthetic_log(idx, status, Some(err.to_string()));
        self.append(log).await;
        self.bus.publish(RunEvent::StepError {
            run_id: self.run.id,
            node_id: self.plan.id(idx).to_owned(),
            error: err.to_string(),
            attempts: 0,
        });
    }

    /// A log for a node the scheduler settled without a step attempt.
    fn synthetic_log(&mut self, idx: usize, status: StepStatus, error: Option<String>) -> StepLog {
        let execution_order = self.order_of(idx);
        let node = self.plan.node(idx);
        let now = Utc::now();
        StepLog {
            id: Uuid::new_v4(),
            run_id: self.run.id,
            node_id: node.id.clone(),
            node_kind: node.kind.label().to_owned(),
            execution_order,
            attempt: 0,
            status,
            started_at: now,
            finished_at: now,
            input: Value::Object(node.inputs.clone()),
            output: None,
            error,
        }
    }

    async fn append(&self, log: StepLog) {
        if let Err(err) = self.sink.append_step_log(&log).await {
            warn!(node_id = %log.node_id, "failed to append step log: {err}");
        }
        self.bus.publish(RunEvent::LogsUpdate {
            run_id: self.run.id,
            log,
        });
    }

    async fn finish(mut self) -> RunSummary {
        let settled = self
            .states
            .iter()
            .all(|s| matches!(s, NodeState::Completed | NodeState::Skipped));

        let status = if self.failure.is_some() {
            RunStatus::Failed
        } else if settled {
            RunStatus::Succeeded
        } else if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            self.failure = Some((None, "run ended with unsettled nodes".into()));
            RunStatus::Failed
        };

        self.run.status = status;
        self.run.finished_at = Some(Utc::now());
        if let Some((node_id, message)) = &self.failure {
            self.run.failed_node_id = node_id.clone();
            self.run.error = Some(message.clone());
        }

        if let Err(err) = self.sink.save_run(&self.run).await {
            warn!("failed to persist final run record: {err}");
        }

        let run_id = self.run.id;
        match status {
            RunStatus::Failed => self.bus.publish(RunEvent::RunError {
                run_id,
                node_id: self.run.failed_node_id.clone(),
                error: self.run.error.clone().unwrap_or_default(),
            }),
            _ => self.bus.publish(RunEvent::RunComplete { run_id, status }),
        }
        self.bus.close();
        info!(run_id = %run_id, status = %status, "run finished");

        let node_states = (0..self.plan.len())
            .map(|i| (self.plan.id(i).to_owned(), self.states[i]))
            .collect();
        RunSummary {
            run: self.run,
            node_states,
            outputs: self.scope.steps().clone(),
        }
    }
}
