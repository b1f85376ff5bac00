//! `ActionRegistry`: maps action ids onto boxed [`Action`] implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{Action, ActionResult, CapabilityError, CapabilityRegistry};

/// In-process registry keyed by action id.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` under `id`, replacing any previous entry.
    pub fn register(&mut self, id: impl Into<String>, action: Arc<dyn Action>) -> &mut Self {
        self.actions.insert(id.into(), action);
        self
    }

    /// Builder-style variant of [`ActionRegistry::register`].
    pub fn with(mut self, id: impl Into<String>, action: Arc<dyn Action>) -> Self {
        self.register(id, action);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.actions.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.ids())
            .finish()
    }
}

#[async_trait]
impl CapabilityRegistry for ActionRegistry {
    async fn execute(
        &self,
        action_id: &str,
        params: Value,
    ) -> Result<ActionResult, CapabilityError> {
        let action = self
            .actions
            .get(action_id)
            .ok_or_else(|| CapabilityError::UnknownAction(action_id.to_owned()))?;
        debug!(action_id, "invoking action");
        action.invoke(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAction;
    use serde_json::json;

    #[tokio::test]
    async fn routes_to_registered_action() {
        let echo = Arc::new(MockAction::returning("echo", json!({ "v": 1 })));
        let registry = ActionRegistry::new().with("echo", echo.clone());

        let result = registry.execute("echo", json!({ "a": true })).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data, Some(json!({ "v": 1 })));
        assert_eq!(echo.call_count(), 1);
        assert_eq!(echo.calls()[0], json!({ "a": true }));
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let registry = ActionRegistry::new();
        let err = registry.execute("missing", Value::Null).await.unwrap_err();
        assert_eq!(err, CapabilityError::UnknownAction("missing".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn ids_are_sorted() {
        let registry = ActionRegistry::new()
            .with("b", Arc::new(MockAction::returning("b", Value::Null)))
            .with("a", Arc::new(MockAction::returning("a", Value::Null)));
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert!(registry.contains("a"));
    }
}
