//! Core abstractions for the stepwise workflow engine
//!
//! This crate provides the data model, the executor contract and the event
//! types that all other components depend on. It runs nothing itself.

mod condition;
mod error;
pub mod events;
mod execution;
mod node;
mod trigger;
mod value;
mod workflow;

pub use condition::{Condition, ConditionOperator, MatchMode};
pub use error::{DefinitionError, EngineError, NodeError};
pub use events::*;
pub use execution::{
    ErrorCategory, ExecutionMetrics, ExecutionStatus, ExecutionStep, StepStatus, WorkflowError,
    WorkflowExecution,
};
pub use node::{FieldDefinition, NodeContext, NodeExecutor, NodeOutput, NodeSchema, NodeValidation};
pub use trigger::{
    ConditionTrigger, EventFilter, EventTrigger, ScheduleTrigger, TriggerId, TriggerKind,
    WorkflowTrigger,
};
pub use value::{resolve_path, Value, Variables};
pub use workflow::{
    EdgeType, ErrorHandling, NodeConfig, NodeId, NodeKind, NodeMetadata, Position,
    WorkflowDefinition, WorkflowEdge, WorkflowId, WorkflowNode, WorkflowSettings,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
