use async_trait::async_trait;
use std::collections::HashMap;
use stepcore::{
    NodeConfig, NodeContext, NodeError, NodeExecutor, NodeOutput, NodeSchema, NodeValidation,
    Value, WorkflowNode,
};

fn result_output(result: bool) -> Value {
    let mut output = HashMap::new();
    output.insert("result".to_string(), Value::Bool(result));
    Value::Object(output)
}

/// Routes to `true_nodes` or `false_nodes` by evaluating one condition.
///
/// With both lists empty the node defers to its outgoing edges.
pub struct DecisionExecutor;

#[async_trait]
impl NodeExecutor for DecisionExecutor {
    fn kind(&self) -> &str {
        "decision"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Decision {
            condition,
            true_nodes,
            false_nodes,
        } = &node.config
        else {
            return Err(NodeError::Configuration(format!(
                "node {} is not a decision node",
                node.id
            )));
        };

        let result = condition.evaluate(&ctx.variables)?;
        tracing::debug!("Decision {} evaluated to {}", node.id, result);

        let output = NodeOutput::new().with_output(result_output(result));
        if true_nodes.is_empty() && false_nodes.is_empty() {
            return Ok(output);
        }
        let next = if result { true_nodes } else { false_nodes };
        Ok(output.with_next(next.clone()))
    }

    fn validate(&self, node: &WorkflowNode) -> NodeValidation {
        let mut report = NodeValidation::default();
        if let NodeConfig::Decision {
            condition,
            true_nodes,
            false_nodes,
        } = &node.config
        {
            if let Err(e) = condition.validate() {
                report.error(e.to_string());
            }
            if true_nodes.is_empty() && false_nodes.is_empty() {
                report.warn("no true_nodes or false_nodes; outgoing edges decide the route");
            }
        }
        report
    }

    fn schema(&self) -> NodeSchema {
        NodeSchema::new("decision")
            .with_description("Choose a branch by evaluating a condition")
            .with_category("control")
            .with_field("condition", "field, operator and value to evaluate", true)
            .with_field("true_nodes", "nodes to run when the condition holds", false)
            .with_field("false_nodes", "nodes to run otherwise", false)
    }
}

/// Guard: continues along the edges when the conditions hold, else ends the path
pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    fn kind(&self) -> &str {
        "condition"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Condition {
            conditions,
            match_mode,
        } = &node.config
        else {
            return Err(NodeError::Configuration(format!(
                "node {} is not a condition node",
                node.id
            )));
        };

        let passed = match_mode.evaluate(conditions, &ctx.variables)?;
        let output = NodeOutput::new().with_output(result_output(passed));
        if passed {
            Ok(output)
        } else {
            ctx.events.info("condition not met, path ends here");
            Ok(output.with_next(Vec::new()))
        }
    }

    fn validate(&self, node: &WorkflowNode) -> NodeValidation {
        let mut report = NodeValidation::default();
        if let NodeConfig::Condition { conditions, .. } = &node.config {
            if conditions.is_empty() {
                report.error("at least one condition is required");
            }
            for condition in conditions {
                if let Err(e) = condition.validate() {
                    report.error(e.to_string());
                }
            }
        }
        report
    }

    fn schema(&self) -> NodeSchema {
        NodeSchema::new("condition")
            .with_description("Stop the path unless the conditions hold")
            .with_category("control")
            .with_field("conditions", "conditions to evaluate", true)
            .with_field("match_mode", "all (default) or any", false)
    }
}
