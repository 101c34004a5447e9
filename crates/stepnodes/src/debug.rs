use crate::action::ActionHandler;
use async_trait::async_trait;
use stepcore::{NodeContext, NodeError, NodeOutput, Value, Variables};

/// `debug.log`: logs a message and the other parameters
pub struct DebugLog;

#[async_trait]
impl ActionHandler for DebugLog {
    fn name(&self) -> &str {
        "debug.log"
    }

    fn description(&self) -> &str {
        "Logs a message and its parameters for debugging"
    }

    async fn call(&self, params: &Variables, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let message = params
            .get("message")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "(no message)".to_string());

        tracing::info!("[{}] DEBUG: {}", ctx.node_id, message);
        ctx.events.info(format!("DEBUG: {}", message));

        let mut keys: Vec<&String> = params.keys().filter(|k| *k != "message").collect();
        keys.sort();
        for key in keys {
            ctx.events.info(format!("  {}: {}", key, params[key]));
        }

        Ok(NodeOutput::new().with_output(Value::String(message)))
    }
}
