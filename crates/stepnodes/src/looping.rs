use async_trait::async_trait;
use std::collections::HashMap;
use stepcore::{
    NodeConfig, NodeContext, NodeError, NodeExecutor, NodeOutput, NodeSchema, NodeValidation,
    Value, WorkflowNode,
};

/// Bounded counter loop.
///
/// Each visit increments `counter` and routes to `body` while the count is
/// below `max_iterations`; then it routes to `exit` and resets the counter so
/// the loop can be entered again. The body is expected to lead back here.
pub struct LoopExecutor;

#[async_trait]
impl NodeExecutor for LoopExecutor {
    fn kind(&self) -> &str {
        "loop"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Loop {
            counter,
            max_iterations,
            body,
            exit,
        } = &node.config
        else {
            return Err(NodeError::Configuration(format!(
                "node {} is not a loop node",
                node.id
            )));
        };

        let count = match ctx.variables.get(counter) {
            None | Some(Value::Null) => 0,
            Some(value) => value.to_number().ok_or_else(|| NodeError::InvalidInputType {
                field: counter.clone(),
                expected: "number".to_string(),
                actual: value.to_string(),
            })? as u32,
        };

        let mut output = HashMap::new();
        if count < *max_iterations {
            output.insert("iteration".to_string(), Value::from((count + 1) as u64));
            output.insert("done".to_string(), Value::Bool(false));
            Ok(NodeOutput::new()
                .with_output(Value::Object(output))
                .with_variable(counter.clone(), Value::from((count + 1) as u64))
                .with_next(body.clone()))
        } else {
            tracing::debug!("Loop {} finished after {} iterations", node.id, count);
            output.insert("iteration".to_string(), Value::from(count as u64));
            output.insert("done".to_string(), Value::Bool(true));
            Ok(NodeOutput::new()
                .with_output(Value::Object(output))
                .with_variable(counter.clone(), Value::from(0u64))
                .with_next(exit.clone()))
        }
    }

    fn validate(&self, node: &WorkflowNode) -> NodeValidation {
        let mut report = NodeValidation::default();
        if let NodeConfig::Loop {
            counter,
            max_iterations,
            body,
            ..
        } = &node.config
        {
            if counter.trim().is_empty() {
                report.error("counter variable name is required");
            }
            if body.is_empty() {
                report.error("loop body is empty");
            }
            if *max_iterations == 0 {
                report.warn("max_iterations is 0; the body never runs");
            }
        }
        report
    }

    fn schema(&self) -> NodeSchema {
        NodeSchema::new("loop")
            .with_description("Repeat a body a bounded number of times")
            .with_category("control")
            .with_field("counter", "context variable holding the iteration count", true)
            .with_field("max_iterations", "number of times the body runs", true)
            .with_field("body", "nodes run on each iteration", true)
            .with_field("exit", "nodes run once the loop is done", false)
    }
}
