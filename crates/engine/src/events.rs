//! Per-run event bus.
//!
//! Each run owns one [`EventBus`], created when the run is prepared and
//! closed when it finishes. Publishing is synchronous and serialised, so
//! every subscriber sees events in emission order. Handlers run inline on
//! the publishing task and must return quickly; hosts that need to do slow
//! work subscribe through [`EventBus::channel`] and drain the receiver on
//! their own task.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use store::{RunStatus, StepLog};

/// Events emitted during a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run:start")]
    RunStart { run_id: Uuid, definition_id: Uuid },

    /// The run finished as `succeeded` or `cancelled`.
    #[serde(rename = "run:complete")]
    RunComplete { run_id: Uuid, status: RunStatus },

    /// Dispatch stopped; in-flight steps keep running.
    #[serde(rename = "run:paused")]
    RunPaused { run_id: Uuid },

    #[serde(rename = "run:resumed")]
    RunResumed { run_id: Uuid },

    /// The run finished as `failed`.
    #[serde(rename = "run:error")]
    RunError {
        run_id: Uuid,
        node_id: Option<String>,
        error: String,
    },

    /// `input` is `None` when input resolution itself failed.
    #[serde(rename = "step:start")]
    StepStart {
        run_id: Uuid,
        node_id: String,
        input: Option<Value>,
    },

    #[serde(rename = "step:complete")]
    StepComplete {
        run_id: Uuid,
        node_id: String,
        output: Value,
        attempts: u32,
    },

    #[serde(rename = "step:error")]
    StepError {
        run_id: Uuid,
        node_id: String,
        error: String,
        attempts: u32,
    },

    /// A step log was appended.
    #[serde(rename = "logs:update")]
    LogsUpdate { run_id: Uuid, log: StepLog },
}

/// Event type keys subscribers filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RunStart,
    RunComplete,
    RunPaused,
    RunResumed,
    RunError,
    StepStart,
    StepComplete,
    StepError,
    LogsUpdate,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStart => "run:start",
            Self::RunComplete => "run:complete",
            Self::RunPaused => "run:paused",
            Self::RunResumed => "run:resumed",
            Self::RunError => "run:error",
            Self::StepStart => "step:start",
            Self::StepComplete => "step:complete",
            Self::StepError => "step:error",
            Self::LogsUpdate => "logs:update",
        }
    }
}

impl RunEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RunStart { .. } => EventKind::RunStart,
            Self::RunComplete { .. } => EventKind::RunComplete,
            Self::RunPaused { .. } => EventKind::RunPaused,
            Self::RunResumed { .. } => EventKind::RunResumed,
            Self::RunError { .. } => EventKind::RunError,
            Self::StepStart { .. } => EventKind::StepStart,
            Self::StepComplete { .. } => EventKind::StepComplete,
            Self::StepError { .. } => EventKind::StepError,
            Self::LogsUpdate { .. } => EventKind::LogsUpdate,
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStart { run_id, .. }
            | Self::RunComplete { run_id, .. }
            | Self::RunPaused { run_id }
            | Self::RunResumed { run_id }
            | Self::RunError { run_id, .. }
            | Self::StepStart { run_id, .. }
            | Self::StepComplete { run_id, .. }
            | Self::StepError { run_id, .. }
            | Self::LogsUpdate { run_id, .. } => *run_id,
        }
    }
}

type Handler = Box<dyn Fn(&RunEvent) + Send + Sync>;

struct Subscriber {
    /// `None` receives every event.
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct Subscribers {
    closed: bool,
    list: Vec<Subscriber>,
}

/// Synchronous publish/subscribe keyed by event type. Cloning shares the bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every event of `kind`.
    pub fn on(&self, kind: EventKind, handler: impl Fn(&RunEvent) + Send + Sync + 'static) {
        self.add(Some(kind), Box::new(handler));
    }

    /// Call `handler` for every event.
    pub fn on_any(&self, handler: impl Fn(&RunEvent) + Send + Sync + 'static) {
        self.add(None, Box::new(handler));
    }

    /// Subscribe to every event through an unbounded channel.
    ///
    /// The receiver yields `None` once the run has finished and the bus is
    /// closed.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_any(move |event| {
            // Receiver may have been dropped.
            let _ = tx.send(event.clone());
        });
        rx
    }

    fn add(&self, kind: Option<EventKind>, handler: Handler) {
        let mut subs = self.lock();
        if !subs.closed {
            subs.list.push(Subscriber { kind, handler });
        }
    }

    /// Deliver `event` to every matching subscriber, in subscription order.
    ///
    /// Handlers must not publish on the same bus. A handler that panics is
    /// unsubscribed; the remaining handlers still receive the event.
    pub fn publish(&self, event: RunEvent) {
        let mut subs = self.lock();
        let kind = event.kind();
        subs.list.retain(|sub| {
            if sub.kind.is_some_and(|k| k != kind) {
                return true;
            }
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event)));
            if delivered.is_err() {
                warn!(event = kind.as_str(), "event handler panicked, unsubscribing it");
            }
            delivered.is_ok()
        });
    }

    /// Drop every subscriber; later publishes and subscriptions are no-ops.
    pub fn close(&self) {
        let mut subs = self.lock();
        subs.closed = true;
        subs.list.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().list.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_start(run_id: Uuid, node: &str) -> RunEvent {
        RunEvent::StepStart {
            run_id,
            node_id: node.into(),
            input: Some(json!({})),
        }
    }

    #[test]
    fn delivers_in_emission_order_filtered_by_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let starts = Arc::new(Mutex::new(0usize));

        let sink = seen.clone();
        bus.on_any(move |e| sink.lock().unwrap().push(e.kind().as_str()));
        let counter = starts.clone();
        bus.on(EventKind::StepStart, move |_| *counter.lock().unwrap() += 1);

        let run_id = Uuid::new_v4();
        bus.publish(RunEvent::RunStart {
            run_id,
            definition_id: Uuid::new_v4(),
        });
        bus.publish(step_start(run_id, "a"));
        bus.publish(step_start(run_id, "b"));
        bus.publish(RunEvent::RunComplete {
            run_id,
            status: RunStatus::Succeeded,
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["run:start", "step:start", "step:start", "run:complete"]
        );
        assert_eq!(*starts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn channel_ends_when_bus_closes() {
        let bus = EventBus::new();
        let mut rx = bus.channel();
        let run_id = Uuid::new_v4();

        bus.publish(step_start(run_id, "a"));
        bus.close();
        bus.publish(step_start(run_id, "b"));

        assert!(matches!(rx.recv().await, Some(RunEvent::StepStart { node_id, .. }) if node_id == "a"));
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn panicking_handler_is_dropped_and_others_still_run() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0usize));

        bus.on(EventKind::StepStart, |_| panic!("handler bug"));
        let counter = seen.clone();
        bus.on_any(move |_| *counter.lock().unwrap() += 1);

        let run_id = Uuid::new_v4();
        bus.publish(step_start(run_id, "a"));
        bus.publish(step_start(run_id, "b"));

        assert_eq!(*seen.lock().unwrap(), 2);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn events_serialize_with_wire_names() {
        let event = RunEvent::RunComplete {
            run_id: Uuid::nil(),
            status: RunStatus::Cancelled,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run:complete");
        assert_eq!(json["status"], "cancelled");
        assert_eq!(event.kind().as_str(), "run:complete");
        assert_eq!(event.run_id(), Uuid::nil());
    }
}
