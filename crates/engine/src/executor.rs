//! Step execution.
//!
//! `StepExecutor` runs exactly one node of a run:
//! 1. Resolves the node's input bindings against the scope snapshot.
//! 2. Dispatches on the node kind, calling the capability registry for
//!    actions and scripts.
//! 3. Applies the node's timeout to registry calls and retries timeouts and
//!    transient failures with exponential back-off.
//! 4. Appends a `StepLog` per attempt and reports progress on the run bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use capability::CapabilityRegistry;
use store::{RunLogSink, StepLog, StepStatus};

use crate::{
    StepError,
    config::EngineConfig,
    events::{EventBus, RunEvent},
    expression::{EvalError, Expression},
    models::{Node, NodeKind},
    resolver::Scope,
};

/// Registry action id that script nodes are routed to.
pub const SCRIPT_ACTION: &str = "script";

/// Everything a step needs from its run.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    /// Position of this node in the run's dispatch order.
    pub execution_order: u32,
    /// Variables and outputs visible to this step, fixed at dispatch.
    pub scope: Scope,
    pub bus: EventBus,
    pub sink: Arc<dyn RunLogSink>,
    pub cancel: CancellationToken,
}

/// How a step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(Value),
    Failed(StepError),
    Cancelled,
}

/// Executes single nodes against a capability registry.
pub struct StepExecutor {
    registry: Arc<dyn CapabilityRegistry>,
    config: EngineConfig,
}

impl StepExecutor {
    pub fn new(registry: Arc<dyn CapabilityRegistry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `node` to completion, failure or cancellation.
    ///
    /// Emits `step:start`, then exactly one of `step:complete` or
    /// `step:error`, with a `logs:update` for every attempt in between.
    #[instrument(skip(self, node, ctx), fields(run_id = %ctx.run_id, node_id = %node.id, kind = node.kind.label()))]
    pub async fn execute(&self, node: &Node, ctx: StepContext) -> StepOutcome {
        let started_at = Utc::now();
        let inputs = match ctx.scope.resolve_map(&node.inputs) {
            Ok(inputs) => inputs,
            Err(err) => {
                ctx.bus.publish(RunEvent::StepStart {
                    run_id: ctx.run_id,
                    node_id: node.id.clone(),
                    input: None,
                });
                let err = StepError::from(err);
                let attempt = Attempt::new(&ctx, node, 1, started_at, Value::Object(node.inputs.clone()));
                self.record(&ctx, attempt.finish(StepStatus::Failed, None, Some(err.to_string())))
                    .await;
                return self.fail(node, &ctx, err, 1);
            }
        };
        let input = Value::Object(inputs.clone());

        ctx.bus.publish(RunEvent::StepStart {
            run_id: ctx.run_id,
            node_id: node.id.clone(),
            input: Some(input.clone()),
        });

        let policy = node.retry.clone().unwrap_or_else(|| self.config.retry.clone());
        let timeout = node
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.step_timeout());
        let max_attempts = policy.attempts();

        let mut attempt_no = 1u32;
        loop {
            let attempt = Attempt::new(&ctx, node, attempt_no, Utc::now(), input.clone());
            let result = self.run_kind(node, &inputs, timeout, &ctx).await;

            match result {
                Ok(output) => {
                    self.record(&ctx, attempt.finish(StepStatus::Completed, Some(output.clone()), None))
                        .await;
                    ctx.bus.publish(RunEvent::StepComplete {
                        run_id: ctx.run_id,
                        node_id: node.id.clone(),
                        output: output.clone(),
                        attempts: attempt_no,
                    });
                    debug!(attempts = attempt_no, "step completed");
                    return StepOutcome::Completed(output);
                }

                Err(StepError::Cancelled) => {
                    self.record(&ctx, attempt.finish(StepStatus::Cancelled, None, Some(StepError::Cancelled.to_string())))
                        .await;
                    return self.cancelled(node, &ctx, attempt_no);
                }

                Err(err) if err.is_retryable() && attempt_no < max_attempts => {
                    self.record(&ctx, attempt.finish(StepStatus::Failed, None, Some(err.to_string())))
                        .await;

                    let delay = policy.delay_after(attempt_no);
                    warn!(
                        "node '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        node.id, attempt_no, max_attempts, delay, err
                    );

                    tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => return self.cancelled(node, &ctx, attempt_no),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if ctx.cancel.is_cancelled() {
                        return self.cancelled(node, &ctx, attempt_no);
                    }
                    attempt_no += 1;
                }

                Err(err) => {
                    self.record(&ctx, attempt.finish(StepStatus::Failed, None, Some(err.to_string())))
                        .await;
                    return self.fail(node, &ctx, err, attempt_no);
                }
            }
        }
    }

    /// Single dispatch point over node kinds.
    async fn run_kind(
        &self,
        node: &Node,
        inputs: &Map<String, Value>,
        timeout: Duration,
        ctx: &StepContext,
    ) -> Result<Value, StepError> {
        match &node.kind {
            NodeKind::ActionCall { action_id } => self.run_action(action_id, inputs, timeout).await,
            NodeKind::Script { language, source } => self.run_script(language, source, inputs, timeout).await,
            NodeKind::Condition { expression } => run_condition(expression, &ctx.scope),
            NodeKind::Delay { duration_ms } => run_delay(*duration_ms, inputs, &ctx.cancel).await,
        }
    }

    async fn run_action(
        &self,
        action_id: &str,
        inputs: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        self.call_registry(action_id, Value::Object(inputs.clone()), timeout).await
    }

    async fn run_script(
        &self,
        language: &str,
        source: &str,
        inputs: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let params = json!({
            "language": language,
            "source": source,
            "input": inputs,
        });
        self.call_registry(SCRIPT_ACTION, params, timeout).await
    }

    async fn call_registry(&self, action_id: &str, params: Value, timeout: Duration) -> Result<Value, StepError> {
        let result = tokio::time::timeout(timeout, self.registry.execute(action_id, params))
            .await
            .map_err(|_| StepError::Timeout(timeout))??;

        if result.success {
            Ok(result.data.unwrap_or(Value::Null))
        } else {
            Err(StepError::Fatal(
                result
                    .error
                    .unwrap_or_else(|| format!("action '{action_id}' reported failure")),
            ))
        }
    }

    async fn record(&self, ctx: &StepContext, log: StepLog) {
        if let Err(err) = ctx.sink.append_step_log(&log).await {
            warn!(node_id = %log.node_id, attempt = log.attempt, "failed to append step log: {err}");
        }
        ctx.bus.publish(RunEvent::LogsUpdate {
            run_id: ctx.run_id,
            log,
        });
    }

    fn fail(&self, node: &Node, ctx: &StepContext, err: StepError, attempts: u32) -> StepOutcome {
        warn!("node '{}' failed after {} attempt(s): {}", node.id, attempts, err);
        ctx.bus.publish(RunEvent::StepError {
            run_id: ctx.run_id,
            node_id: node.id.clone(),
            error: err.to_string(),
            attempts,
        });
        StepOutcome::Failed(err)
    }

    fn cancelled(&self, node: &Node, ctx: &StepContext, attempts: u32) -> StepOutcome {
        ctx.bus.publish(RunEvent::StepError {
            run_id: ctx.run_id,
            node_id: node.id.clone(),
            error: StepError::Cancelled.to_string(),
            attempts,
        });
        StepOutcome::Cancelled
    }
}

fn run_condition(expression: &str, scope: &Scope) -> Result<Value, StepError> {
    let expr = Expression::parse(expression).map_err(|e| StepError::Fatal(e.to_string()))?;
    match expr.evaluate(scope) {
        Ok(result) => Ok(json!({ "result": result })),
        Err(EvalError::Unresolved(unresolved)) => Err(unresolved.into()),
        Err(err) => Err(StepError::Fatal(err.to_string())),
    }
}

async fn run_delay(duration_ms: u64, inputs: &Map<String, Value>, cancel: &CancellationToken) -> Result<Value, StepError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => Ok(Value::Object(inputs.clone())),
    }
}

/// A step log under construction.
struct Attempt {
    log: StepLog,
}

impl Attempt {
    fn new(ctx: &StepContext, node: &Node, attempt: u32, started_at: DateTime<Utc>, input: Value) -> Self {
        Self {
            log: StepLog {
                id: Uuid::new_v4(),
                run_id: ctx.run_id,
                node_id: node.id.clone(),
                node_kind: node.kind.label().to_owned(),
                execution_order: ctx.execution_order,
                attempt,
                status: StepStatus::Completed,
                started_at,
                finished_at: started_at,
                input,
                output: None,
                error: None,
            },
        }
    }

    fn finish(mut self, status: StepStatus, output: Option<Value>, error: Option<String>) -> StepLog {
        self.log.status = status;
        self.log.finished_at = Utc::now();
        self.log.output = output;
        self.log.error = error;
        self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capability::mock::{FnAction, MockAction};
    use capability::{ActionRegistry, ActionResult, CapabilityError};
    use store::{MemoryStore, RunStore};
    use crate::config::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn context(store: &MemoryStore) -> StepContext {
        StepContext {
            run_id: Uuid::new_v4(),
            execution_order: 1,
            scope: Scope::default(),
            bus: EventBus::new(),
            sink: Arc::new(store.clone()),
            cancel: CancellationToken::new(),
        }
    }

    fn executor(registry: ActionRegistry) -> StepExecutor {
        StepExecutor::new(Arc::new(registry), EngineConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_action_retries_then_completes() {
        let mock = Arc::new(MockAction::flaky("rpc", 2, json!({ "ok": true })));
        let exec = executor(ActionRegistry::new().with("rpc", mock.clone()));
        let store = MemoryStore::new();
        let ctx = context(&store);
        let run_id = ctx.run_id;

        let outcome = exec.execute(&Node::action("call", "rpc"), ctx).await;

        assert_eq!(outcome, StepOutcome::Completed(json!({ "ok": true })));
        assert_eq!(mock.call_count(), 3);
        let logs = store.list_step_logs(run_id).await.unwrap();
        let statuses: Vec<_> = logs.iter().map(|l| (l.attempt, l.status)).collect();
        assert_eq!(
            statuses,
            vec![(1, StepStatus::Failed), (2, StepStatus::Failed), (3, StepStatus::Completed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let mock = Arc::new(MockAction::failing_fatal("rpc", "bad abi"));
        let exec = executor(ActionRegistry::new().with("rpc", mock.clone()));
        let store = MemoryStore::new();

        let outcome = exec.execute(&Node::action("call", "rpc"), context(&store)).await;

        assert!(matches!(outcome, StepOutcome::Failed(StepError::Fatal(msg)) if msg.contains("bad abi")));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reported_failure_is_fatal() {
        let mock = Arc::new(MockAction::reporting_failure("rpc", "reverted"));
        let exec = executor(ActionRegistry::new().with("rpc", mock.clone()));

        let outcome = exec
            .execute(&Node::action("call", "rpc"), context(&MemoryStore::new()))
            .await;

        assert_eq!(outcome, StepOutcome::Failed(StepError::Fatal("reverted".into())));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_action_fails_without_retry() {
        let exec = executor(ActionRegistry::new());
        let outcome = exec
            .execute(&Node::action("call", "missing"), context(&MemoryStore::new()))
            .await;
        assert!(matches!(outcome, StepOutcome::Failed(StepError::Fatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_action_times_out_on_every_attempt() {
        let mock = Arc::new(MockAction::returning("slow", json!(1)).with_latency(Duration::from_secs(10)));
        let exec = executor(ActionRegistry::new().with("slow", mock.clone()));
        let node = Node::action("call", "slow")
            .with_timeout_ms(50)
            .with_retry(RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            });

        let outcome = exec.execute(&node, context(&MemoryStore::new())).await;

        assert_eq!(outcome, StepOutcome::Failed(StepError::Timeout(Duration::from_millis(50))));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn script_node_routes_to_script_runner() {
        let seen = Arc::new(Mutex::new(Value::Null));
        let sink = seen.clone();
        let runner = FnAction::new(move |params: Value| {
            *sink.lock().unwrap() = params;
            Ok(ActionResult::ok(json!("done")))
        });
        let exec = executor(ActionRegistry::new().with(SCRIPT_ACTION, Arc::new(runner)));
        let node = Node::script("deploy", "js", "return 1").input("n", json!(2));

        let outcome = exec.execute(&node, context(&MemoryStore::new())).await;

        assert_eq!(outcome, StepOutcome::Completed(json!("done")));
        assert_eq!(
            *seen.lock().unwrap(),
            json!({ "language": "js", "source": "return 1", "input": { "n": 2 } })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_input_fails_before_any_attempt() {
        let mock = Arc::new(MockAction::returning("rpc", json!(1)));
        let exec = executor(ActionRegistry::new().with("rpc", mock.clone()));
        let store = MemoryStore::new();
        let ctx = context(&store);
        let run_id = ctx.run_id;
        let mut events = ctx.bus.channel();
        let node = Node::action("call", "rpc").input("x", json!("{{ variables.missing }}"));

        let outcome = exec.execute(&node, ctx).await;

        assert!(matches!(outcome, StepOutcome::Failed(StepError::UnresolvedReference(_))));
        assert_eq!(mock.call_count(), 0);
        assert_eq!(store.list_step_logs(run_id).await.unwrap().len(), 1);
        assert!(matches!(events.recv().await, Some(RunEvent::StepStart { input: None, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn condition_and_delay_run_without_registry() {
        let exec = executor(ActionRegistry::new());
        let mut vars = Map::new();
        vars.insert("x".into(), json!(5));
        let mut ctx = context(&MemoryStore::new());
        ctx.scope = Scope::new(vars);

        let outcome = exec
            .execute(&Node::condition("big", "variables.x > 3"), ctx.clone())
            .await;
        assert_eq!(outcome, StepOutcome::Completed(json!({ "result": true })));

        let node = Node::delay("wait", 1_000).input("value", json!("{{ variables.x }}"));
        let outcome = exec.execute(&node, ctx).await;
        assert_eq!(outcome, StepOutcome::Completed(json!({ "value": 5 })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_at_a_zero_backoff_stops_retrying() {
        let node = Node::action("call", "rpc").with_retry(RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 0,
            ..RetryPolicy::default()
        });

        // Both select arms are ready at once; repeat to rule out a lucky pick.
        for _ in 0..32 {
            let ctx = context(&MemoryStore::new());
            let token = ctx.cancel.clone();
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();
            let action = FnAction::new(move |_params: Value| {
                counter.fetch_add(1, Ordering::SeqCst);
                token.cancel();
                Err(CapabilityError::Transient("connection reset".into()))
            });
            let exec = executor(ActionRegistry::new().with("rpc", Arc::new(action)));

            assert_eq!(exec.execute(&node, ctx).await, StepOutcome::Cancelled);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_delay() {
        let exec = executor(ActionRegistry::new());
        let store = MemoryStore::new();
        let ctx = context(&store);
        let run_id = ctx.run_id;
        let cancel = ctx.cancel.clone();

        let node = Node::delay("wait", 60_000);
        let step = exec.execute(&node, ctx);
        let (outcome, _) = tokio::join!(step, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        assert_eq!(outcome, StepOutcome::Cancelled);
        let logs = store.list_step_logs(run_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, StepStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_start_log_and_complete_in_order() {
        let exec = executor(ActionRegistry::new().with("rpc", Arc::new(MockAction::returning("rpc", json!(7)))));
        let ctx = context(&MemoryStore::new());
        let mut events = ctx.bus.channel();

        exec.execute(&Node::action("call", "rpc"), ctx).await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind().as_str());
        }
        assert_eq!(kinds, vec!["step:start", "logs:update", "step:complete"]);
    }
}
