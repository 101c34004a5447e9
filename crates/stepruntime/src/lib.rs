//! Workflow execution runtime
//!
//! This crate provides the engine that validates and runs workflow
//! definitions, the node executor registry, and the trigger subsystem that
//! starts executions on schedules, events and conditions.

mod executor;
mod metrics;
mod registry;
mod runtime;
pub mod triggers;
mod validation;

pub use executor::{output_key, ExecutionHandle, WorkflowExecutor};
pub use metrics::WorkflowMetrics;
pub use registry::ExecutorRegistry;
pub use runtime::{ExecutionRequest, RuntimeConfig, WorkflowEngine};
pub use triggers::{
    ConditionSource, ConditionTracker, FactStore, Schedule, ScheduleError, TriggerManager,
    WorkflowInvoker,
};
pub use validation::{validate_workflow, ValidationResult};
