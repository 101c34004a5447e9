use crate::events::ExecutionId;
use crate::execution::ExecutionStatus;
use crate::workflow::{NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow {workflow_id} failed validation: {}", summarize(.errors))]
    InvalidWorkflow {
        workflow_id: WorkflowId,
        errors: Vec<DefinitionError>,
    },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("Capacity exceeded: {limit} executions already running")]
    CapacityExceeded { limit: usize },

    #[error("Execution {execution_id} cannot go from {from} to {to}")]
    InvalidTransition {
        execution_id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Trigger error: {0}")]
    Trigger(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn summarize(errors: &[DefinitionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("No executor registered for node kind '{0}'")]
    UnknownKind(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("Cancelled")]
    Cancelled,
}

/// A structural problem found while validating a definition
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DefinitionError {
    #[error("Workflow has no start node")]
    MissingStartNode,

    #[error("Duplicate node id: {node}")]
    DuplicateNode { node: NodeId },

    #[error("Edge {from} -> {to} references missing node {missing}")]
    DanglingEdge {
        from: NodeId,
        to: NodeId,
        missing: NodeId,
    },

    #[error("Node {node} references missing node {missing}")]
    DanglingReference { node: NodeId, missing: NodeId },

    #[error("Node {node} has unknown kind '{kind}'")]
    UnknownNodeKind { node: NodeId, kind: String },

    #[error("Node {node} is invalid: {reason}")]
    InvalidNode { node: NodeId, reason: String },

    #[error("Edge {from} -> {to} has an invalid condition: {reason}")]
    InvalidCondition {
        from: NodeId,
        to: NodeId,
        reason: String,
    },
}
