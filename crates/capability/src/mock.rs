//! Test doubles for [`Action`].
//!
//! `MockAction` replays a scripted sequence of behaviours and records every
//! call; `FnAction` wraps a closure for one-off computations in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Action, ActionResult, CapabilityError};

/// Behaviour injected into `MockAction` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Succeed with a specific JSON value.
    ReturnValue(Value),
    /// Run, but report `success: false`.
    ReportFailure(String),
    /// Fail with a `Transient` error.
    FailTransient(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
}

/// A mock action that records every call it receives.
///
/// Scripted behaviours are consumed one per call; once the script is empty
/// every further call uses the fallback behaviour.
pub struct MockAction {
    /// Label used in test assertions.
    pub name: String,
    script: Mutex<VecDeque<MockBehaviour>>,
    fallback: MockBehaviour,
    latency: Option<Duration>,
    calls: Arc<Mutex<Vec<Value>>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAction {
    fn with_behaviour(name: impl Into<String>, fallback: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            latency: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Always replies with `success: false`.
    pub fn reporting_failure(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReportFailure(msg.into()))
    }

    /// Always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Always fails with a `Transient` error.
    pub fn failing_transient(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailTransient(msg.into()))
    }

    /// Fails transiently `failures` times, then succeeds with `value`.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        let mock = Self::returning(name, value);
        {
            let mut script = mock.script.lock().unwrap();
            for n in 0..failures {
                script.push_back(MockBehaviour::FailTransient(format!("flake #{}", n + 1)));
            }
        }
        mock
    }

    /// Sleep for `latency` before every reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of times this action has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// All parameters seen by this action, in call order.
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of overlapping invocations observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_behaviour(&self) -> MockBehaviour {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Action for MockAction {
    async fn invoke(&self, params: Value) -> Result<ActionResult, CapabilityError> {
        self.calls.lock().unwrap().push(params);
        let behaviour = self.next_behaviour();

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match behaviour {
            MockBehaviour::ReturnValue(v) => Ok(ActionResult::ok(v)),
            MockBehaviour::ReportFailure(msg) => Ok(ActionResult::failure(msg)),
            MockBehaviour::FailTransient(msg) => Err(CapabilityError::Transient(msg)),
            MockBehaviour::FailFatal(msg) => Err(CapabilityError::Fatal(msg)),
        }
    }
}

/// An action backed by a plain closure over the input parameters.
pub struct FnAction<F> {
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(Value) -> Result<ActionResult, CapabilityError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(Value) -> Result<ActionResult, CapabilityError> + Send + Sync,
{
    async fn invoke(&self, params: Value) -> Result<ActionResult, CapabilityError> {
        (self.f)(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn flaky_fails_then_recovers() {
        let action = MockAction::flaky("flaky", 2, json!(7));

        assert!(matches!(
            action.invoke(json!({})).await,
            Err(CapabilityError::Transient(_))
        ));
        assert!(matches!(
            action.invoke(json!({})).await,
            Err(CapabilityError::Transient(_))
        ));
        let third = action.invoke(json!({})).await.unwrap();
        assert_eq!(third.data, Some(json!(7)));
        assert_eq!(action.call_count(), 3);
    }

    #[tokio::test]
    async fn reporting_failure_is_not_an_error() {
        let action = MockAction::reporting_failure("revert", "execution reverted");
        let result = action.invoke(Value::Null).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("execution reverted"));
    }

    #[tokio::test]
    async fn fn_action_sees_params() {
        let double = FnAction::new(|params: Value| {
            let x = params["x"].as_i64().unwrap_or_default();
            Ok(ActionResult::ok(json!({ "value": x * 2 })))
        });
        let result = double.invoke(json!({ "x": 21 })).await.unwrap();
        assert_eq!(result.data, Some(json!({ "value": 42 })));
    }
}
