use crate::events::{EventEmitter, ExecutionId};
use crate::value::{resolve_path, Value, Variables};
use crate::workflow::{NodeId, WorkflowId, WorkflowNode};
use crate::NodeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Behaviour of one node kind
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Kind this executor serves (e.g. "action", "delay", "crm.sync")
    fn kind(&self) -> &str;

    /// Run `node` against a snapshot of the execution context
    async fn execute(&self, node: &WorkflowNode, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Check kind-specific configuration at registration time
    fn validate(&self, _node: &WorkflowNode) -> NodeValidation {
        NodeValidation::default()
    }

    /// Describe the configuration this kind accepts
    fn schema(&self) -> NodeSchema {
        NodeSchema::new(self.kind())
    }
}

/// Execution context passed to each executor call
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,

    /// Context variables as of the start of this step
    pub variables: Variables,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancelled when the execution is cancelled or the step times out
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn variable(&self, path: &str) -> Option<&Value> {
        resolve_path(&self.variables, path)
    }

    /// Get a required variable or return error
    pub fn require_variable(&self, path: &str) -> Result<&Value, NodeError> {
        self.variable(path)
            .ok_or_else(|| NodeError::MissingVariable(path.to_string()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Result of a successful executor call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Stored under `<node_id>_output` in the context
    pub output: Value,

    /// Merged into the context
    pub variables: Variables,

    /// Overrides edge following when set
    pub next_nodes: Option<Vec<NodeId>>,

    /// Ends the current path successfully
    pub stop: bool,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, value: impl Into<Value>) -> Self {
        self.output = value.into();
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_next(mut self, nodes: Vec<NodeId>) -> Self {
        self.next_nodes = Some(nodes);
        self
    }

    pub fn stop(mut self) -> Self {
        self.stop = true;
        self
    }
}

/// Findings from `NodeExecutor::validate`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl NodeValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Schema of a node kind's configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSchema {
    pub kind: String,
    pub description: String,
    pub category: String,
    pub fields: Vec<FieldDefinition>,
}

impl NodeSchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: String::new(),
            category: "general".to_string(),
            fields: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        self.fields.push(FieldDefinition {
            name: name.into(),
            description: description.into(),
            required,
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}
