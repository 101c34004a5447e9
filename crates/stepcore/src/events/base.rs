use crate::{NodeId, Value, Variables, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Lifecycle events published by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    WorkflowRegistered {
        workflow_id: WorkflowId,
        version: String,
        warnings: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowUnregistered {
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        triggered_by: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ExecutionFailed {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCancelled {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    ExecutionPaused {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    ExecutionResumed {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: NodeId,
        node_kind: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: NodeId,
        output: Value,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeRetrying {
        execution_id: ExecutionId,
        node_id: NodeId,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        execution_id: ExecutionId,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
    TriggerAdded {
        trigger_id: String,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    TriggerRemoved {
        trigger_id: String,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    TriggerFired {
        trigger_id: String,
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
    TriggerError {
        trigger_id: String,
        workflow_id: WorkflowId,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// The execution this event belongs to, if any
    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            EngineEvent::ExecutionStarted { execution_id, .. }
            | EngineEvent::ExecutionCompleted { execution_id, .. }
            | EngineEvent::ExecutionFailed { execution_id, .. }
            | EngineEvent::ExecutionCancelled { execution_id, .. }
            | EngineEvent::ExecutionPaused { execution_id, .. }
            | EngineEvent::ExecutionResumed { execution_id, .. }
            | EngineEvent::NodeStarted { execution_id, .. }
            | EngineEvent::NodeCompleted { execution_id, .. }
            | EngineEvent::NodeFailed { execution_id, .. }
            | EngineEvent::NodeRetrying { execution_id, .. }
            | EngineEvent::NodeEvent { execution_id, .. }
            | EngineEvent::TriggerFired { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }
}

/// Events emitted by an executor while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Message delivered on the external event channel consumed by event triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub channel: String,
    #[serde(default)]
    pub payload: Variables,
    pub timestamp: DateTime<Utc>,
}

impl EventMessage {
    pub fn new(channel: impl Into<String>, payload: Variables) -> Self {
        Self {
            channel: channel.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Event emitter handed to executors for real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    node_id: NodeId,
    sender: broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        node_id: NodeId,
        sender: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            execution_id,
            node_id,
            sender,
        }
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(EngineEvent::NodeEvent {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(NodeEvent::Progress { percent, message });
    }
}

/// Broadcast bus for engine lifecycle events
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish; having no subscribers is not an error
    pub fn emit(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers; event dropped");
        }
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, node_id: NodeId) -> EventEmitter {
        EventEmitter::new(execution_id, node_id, self.sender.clone())
    }
}
