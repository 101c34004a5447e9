use async_trait::async_trait;
use stepcore::{
    NodeConfig, NodeContext, NodeError, NodeExecutor, NodeOutput, NodeSchema, NodeValidation,
    Value, WorkflowNode,
};
use tokio::time::{sleep, Duration};

const ONE_HOUR_MS: u64 = 60 * 60 * 1000;

/// Waits `duration_ms`, stopping early when the execution is cancelled
pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    fn kind(&self) -> &str {
        "delay"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Delay { duration_ms } = node.config else {
            return Err(NodeError::Configuration(format!(
                "node {} is not a delay node",
                node.id
            )));
        };

        ctx.events.info(format!("Delaying for {}ms", duration_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(duration_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }

        Ok(NodeOutput::new().with_output(Value::from(duration_ms)))
    }

    fn validate(&self, node: &WorkflowNode) -> NodeValidation {
        let mut report = NodeValidation::default();
        if let NodeConfig::Delay { duration_ms } = node.config {
            if duration_ms > ONE_HOUR_MS {
                report.warn(format!(
                    "delay of {}ms is longer than one hour",
                    duration_ms
                ));
            }
        }
        report
    }

    fn schema(&self) -> NodeSchema {
        NodeSchema::new("delay")
            .with_description("Delay execution for specified milliseconds")
            .with_category("time")
            .with_field("duration_ms", "milliseconds to wait", true)
    }
}
