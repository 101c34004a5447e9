use chrono::{DateTime, Utc};
use serde::Serialize;
use stepcore::{ExecutionStatus, WorkflowExecution, WorkflowId};

/// Aggregate view over a workflow's retained executions
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowMetrics {
    pub workflow_id: WorkflowId,
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    /// Mean over successful executions only
    pub average_duration_ms: f64,
    /// successful / total, 0 when there are no executions
    pub success_rate: f64,
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl WorkflowMetrics {
    /// Derive metrics from execution records; nothing is cached.
    pub fn from_executions<'a>(
        workflow_id: impl Into<WorkflowId>,
        executions: impl IntoIterator<Item = &'a WorkflowExecution>,
    ) -> Self {
        let mut total = 0;
        let mut failed = 0;
        let mut durations = Vec::new();
        let mut last = None;

        for exec in executions {
            total += 1;
            match exec.status {
                ExecutionStatus::Completed => durations.push(exec.duration_ms().unwrap_or(0)),
                ExecutionStatus::Failed => failed += 1,
                _ => {}
            }
            last = last.max(Some(exec.started_at));
        }

        let successful = durations.len();
        let average_duration_ms = if successful == 0 {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / successful as f64
        };
        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        };

        Self {
            workflow_id: workflow_id.into(),
            total_executions: total,
            successful_executions: successful,
            failed_executions: failed,
            average_duration_ms,
            success_rate,
            last_execution_at: last,
        }
    }
}
