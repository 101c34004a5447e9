use crate::events::ExecutionId;
use crate::value::{Value, Variables};
use crate::workflow::{NodeId, WorkflowId};
use crate::NodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    /// Finished executions never run again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Record of one node visit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub node_id: NodeId,
    pub node_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: StepStatus,
    pub input: Variables,
    pub output: Option<Value>,
    pub error: Option<WorkflowError>,
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
}

impl ExecutionStep {
    pub fn begin(node_id: impl Into<NodeId>, node_name: impl Into<String>, input: Variables) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: StepStatus::Running,
            input,
            output: None,
            error: None,
            duration_ms: None,
            retry_count: 0,
        }
    }

    pub fn complete(&mut self, output: Value) {
        self.output = Some(output);
        self.finish(StepStatus::Completed);
    }

    pub fn fail(&mut self, error: WorkflowError) {
        self.error = Some(error);
        self.finish(StepStatus::Failed);
    }

    fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = Some(elapsed_ms(self.started_at, now));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Execution,
    Timeout,
    Validation,
    System,
    User,
}

/// Structured failure attached to a step and to its execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    pub id: Uuid,
    pub node_id: Option<NodeId>,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Variables,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
    pub retryable: bool,
}

impl WorkflowError {
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        let (recoverable, retryable) = match category {
            ErrorCategory::Execution | ErrorCategory::Timeout => (true, true),
            ErrorCategory::User => (true, false),
            ErrorCategory::Validation | ErrorCategory::System => (false, false),
        };
        Self {
            id: Uuid::new_v4(),
            node_id: None,
            category,
            code: code.into(),
            message: message.into(),
            details: Variables::new(),
            timestamp: Utc::now(),
            recoverable,
            retryable,
        }
    }

    /// Classify an executor failure
    pub fn from_node_error(node_id: impl Into<NodeId>, error: &NodeError) -> Self {
        let (category, code) = match error {
            NodeError::ExecutionFailed(_) => (ErrorCategory::Execution, "execution_failed"),
            NodeError::Timeout { .. } => (ErrorCategory::Timeout, "timeout"),
            NodeError::Configuration(_) => (ErrorCategory::Validation, "configuration"),
            NodeError::MissingVariable(_) => (ErrorCategory::User, "missing_variable"),
            NodeError::InvalidInputType { .. } => (ErrorCategory::User, "invalid_input"),
            NodeError::UnknownKind(_) => (ErrorCategory::System, "unknown_kind"),
            NodeError::Panicked(_) => (ErrorCategory::System, "executor_panicked"),
            NodeError::Cancelled => (ErrorCategory::System, "cancelled"),
        };
        let mut err = Self::new(category, code, error.to_string()).with_node(node_id);
        if let NodeError::Timeout { millis } = error {
            err.details.insert("timeout_ms".into(), Value::from(*millis));
        }
        err
    }

    pub fn with_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "[{}] node {}: {}", self.code, node, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Aggregate counters for one execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_nodes: usize,
    pub successful_nodes: usize,
    pub failed_nodes: usize,
    pub retries: u32,
    pub duration_ms: Option<u64>,
}

/// One run of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_node: Option<NodeId>,
    pub context: Variables,
    pub steps: Vec<ExecutionStep>,
    pub errors: Vec<WorkflowError>,
    pub metrics: ExecutionMetrics,
    pub triggered_by: String,
    pub parent_execution_id: Option<ExecutionId>,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: impl Into<WorkflowId>,
        workflow_version: impl Into<String>,
        context: Variables,
        triggered_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            workflow_version: workflow_version.into(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            current_node: None,
            context,
            steps: Vec::new(),
            errors: Vec::new(),
            metrics: ExecutionMetrics::default(),
            triggered_by: triggered_by.into(),
            parent_execution_id: None,
        }
    }

    /// Move to a terminal status and stamp the duration
    pub fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.metrics.duration_ms = Some(elapsed_ms(self.started_at, now));
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at.map(|end| elapsed_ms(self.started_at, end))
    }

    /// Steps recorded for `node_id`, in visitation order
    pub fn steps_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ExecutionStep> + 'a {
        self.steps.iter().filter(move |s| s.node_id == node_id)
    }

    pub fn last_error(&self) -> Option<&WorkflowError> {
        self.errors.last()
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}
