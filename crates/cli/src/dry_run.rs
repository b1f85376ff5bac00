//! Capability registry used by `flowctl run`.
//!
//! Every action id (including the script runner) succeeds and hands its
//! parameters straight back, so a definition's data flow can be exercised
//! without touching a chain.

use async_trait::async_trait;
use capability::{ActionResult, CapabilityError, CapabilityRegistry};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Default)]
pub struct EchoRegistry;

#[async_trait]
impl CapabilityRegistry for EchoRegistry {
    async fn execute(&self, action_id: &str, params: Value) -> Result<ActionResult, CapabilityError> {
        info!(action_id, %params, "dry-run action");
        Ok(ActionResult::ok(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echoes_parameters_for_any_action() {
        let result = EchoRegistry.execute("transfer", json!({ "to": "0xabc" })).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data, Some(json!({ "to": "0xabc" })));
    }
}
