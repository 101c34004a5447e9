//! Structural node kinds: start, end and the parallel fork/join markers.
//!
//! The engine gives `parallel` and `merge` their meaning; the executors here
//! only record that the node was passed.

use async_trait::async_trait;
use stepcore::{NodeContext, NodeError, NodeExecutor, NodeOutput, NodeSchema, WorkflowNode};

pub struct StartExecutor;

#[async_trait]
impl NodeExecutor for StartExecutor {
    fn kind(&self) -> &str {
        "start"
    }

    async fn execute(&self, _node: &WorkflowNode, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new())
    }

    fn schema(&self) -> NodeSchema {
        NodeSchema::new("start")
            .with_description("Entry point of the workflow")
            .with_category("control")
    }
}

/// Ends the current path
pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    fn kind(&self) -> &str {
        "end"
    }

    async fn execute(&self, _node: &WorkflowNode, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new().stop())
    }

    fn schema(&self) -> NodeSchema {
        NodeSchema::new("end")
            .with_description("Terminates the execution path")
            .with_category("control")
    }
}

pub struct ParallelExecutor;

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    fn kind(&self) -> &str {
        "parallel"
    }

    async fn execute(&self, _node: &WorkflowNode, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        ctx.events.info("forking parallel branches");
        Ok(NodeOutput::new())
    }

    fn schema(&self) -> NodeSchema {
        NodeSchema::new("parallel")
            .with_description("Runs every outgoing branch concurrently until they reach a merge node")
            .with_category("control")
    }
}

pub struct MergeExecutor;

#[async_trait]
impl NodeExecutor for MergeExecutor {
    fn kind(&self) -> &str {
        "merge"
    }

    async fn execute(&self, _node: &WorkflowNode, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new())
    }

    fn schema(&self) -> NodeSchema {
        NodeSchema::new("merge")
            .with_description("Join point for parallel branches")
            .with_category("control")
    }
}
