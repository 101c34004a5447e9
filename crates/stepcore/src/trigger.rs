use crate::condition::Condition;
use crate::value::Value;
use crate::workflow::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TriggerId = String;

/// Standing rule that invokes a workflow automatically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub id: TriggerId,
    pub workflow_id: WorkflowId,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub kind: TriggerKind,
}

fn enabled_by_default() -> bool {
    true
}

impl WorkflowTrigger {
    pub fn new(id: impl Into<TriggerId>, workflow_id: impl Into<WorkflowId>, kind: TriggerKind) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            enabled: true,
            kind,
        }
    }

    pub fn schedule(
        id: impl Into<TriggerId>,
        workflow_id: impl Into<WorkflowId>,
        expression: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            workflow_id,
            TriggerKind::Schedule(ScheduleTrigger {
                expression: expression.into(),
                start_at: None,
                end_at: None,
                max_executions: None,
            }),
        )
    }

    pub fn event(
        id: impl Into<TriggerId>,
        workflow_id: impl Into<WorkflowId>,
        channel: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            workflow_id,
            TriggerKind::Event(EventTrigger {
                channel: channel.into(),
                filter: None,
            }),
        )
    }

    pub fn condition(
        id: impl Into<TriggerId>,
        workflow_id: impl Into<WorkflowId>,
        conditions: Vec<Condition>,
        poll_interval_ms: u64,
        consecutive_matches: u32,
    ) -> Self {
        Self::new(
            id,
            workflow_id,
            TriggerKind::Condition(ConditionTrigger {
                conditions,
                poll_interval_ms,
                consecutive_matches,
            }),
        )
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Cap on schedule fires. No effect on other kinds.
    pub fn with_max_executions(mut self, max: u64) -> Self {
        if let TriggerKind::Schedule(schedule) = &mut self.kind {
            schedule.max_executions = Some(max);
        }
        self
    }

    /// Payload filter for event triggers. No effect on other kinds.
    pub fn with_filter(mut self, field: impl Into<String>, equals: impl Into<Value>) -> Self {
        if let TriggerKind::Event(event) = &mut self.kind {
            event.filter = Some(EventFilter {
                field: field.into(),
                equals: equals.into(),
            });
        }
        self
    }

    /// Tag recorded as the execution's `triggered_by`
    pub fn source_tag(&self) -> String {
        format!("trigger:{}", self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    Schedule(ScheduleTrigger),
    Event(EventTrigger),
    Condition(ConditionTrigger),
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Schedule(_) => "schedule",
            TriggerKind::Event(_) => "event",
            TriggerKind::Condition(_) => "condition",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    /// `every 30s`, `@every 5m`, `hourly`, or a 5/6-field cron expression
    pub expression: String,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_executions: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTrigger {
    pub channel: String,
    #[serde(default)]
    pub filter: Option<EventFilter>,
}

/// Payload field that must equal a literal for the event to fire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub field: String,
    pub equals: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionTrigger {
    pub conditions: Vec<Condition>,
    pub poll_interval_ms: u64,
    /// Matching polls in a row required before firing
    #[serde(default = "one")]
    pub consecutive_matches: u32,
}

fn one() -> u32 {
    1
}
