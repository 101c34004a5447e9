//! Trigger subsystem: standing rules that start executions on their own.
//!
//! Every enabled trigger runs as one background task owning a cancellation
//! token. Tasks reach the engine only through [`WorkflowInvoker`], and any
//! failure is published as a `TriggerError` event rather than ending the task.

mod condition;
mod event;
mod schedule;

pub use condition::{ConditionSource, ConditionTracker, FactStore};
pub use event::matches_filter;
pub use schedule::{Schedule, ScheduleError};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stepcore::{
    EngineError, EngineEvent, EventBus, EventMessage, ExecutionId, ScheduleTrigger, TriggerId,
    TriggerKind, Variables, WorkflowId, WorkflowTrigger,
};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// How trigger tasks start executions
#[async_trait]
pub trait WorkflowInvoker: Send + Sync {
    async fn invoke(
        &self,
        workflow_id: &str,
        input: Variables,
        triggered_by: String,
    ) -> Result<ExecutionId, EngineError>;
}

struct ActiveTrigger {
    spec: WorkflowTrigger,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Accepted fires so far; outlives the task across disable and replace
    fired: Arc<AtomicU64>,
}

impl ActiveTrigger {
    /// The task sees the cancellation at its next await point
    fn stop(&mut self) {
        self.cancel.cancel();
        self.task.take();
    }

    fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Everything a running trigger task needs
pub(crate) struct TriggerTask {
    trigger: WorkflowTrigger,
    invoker: Arc<dyn WorkflowInvoker>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    fired: Arc<AtomicU64>,
}

impl TriggerTask {
    /// Start one execution; `true` when the engine accepted it.
    async fn fire(&self, input: Variables) -> bool {
        let result = self
            .invoker
            .invoke(&self.trigger.workflow_id, input, self.trigger.source_tag())
            .await;
        match result {
            Ok(execution_id) => {
                tracing::info!(
                    "Trigger {} started execution {} of {}",
                    self.trigger.id,
                    execution_id,
                    self.trigger.workflow_id
                );
                self.fired.fetch_add(1, Ordering::SeqCst);
                self.events.emit(EngineEvent::TriggerFired {
                    trigger_id: self.trigger.id.clone(),
                    workflow_id: self.trigger.workflow_id.clone(),
                    execution_id,
                    timestamp: Utc::now(),
                });
                true
            }
            Err(e) => {
                self.report(e.to_string());
                false
            }
        }
    }

    fn report(&self, error: impl Into<String>) {
        let error = error.into();
        tracing::warn!("Trigger {} error: {}", self.trigger.id, error);
        self.events.emit(EngineEvent::TriggerError {
            trigger_id: self.trigger.id.clone(),
            workflow_id: self.trigger.workflow_id.clone(),
            error,
            timestamp: Utc::now(),
        });
    }
}

/// Owns the active triggers and their tasks
pub struct TriggerManager {
    triggers: RwLock<HashMap<TriggerId, ActiveTrigger>>,
    invoker: Arc<dyn WorkflowInvoker>,
    events: Arc<EventBus>,
    channel: broadcast::Sender<EventMessage>,
    conditions: Arc<dyn ConditionSource>,
}

impl TriggerManager {
    pub fn new(
        invoker: Arc<dyn WorkflowInvoker>,
        events: Arc<EventBus>,
        conditions: Arc<dyn ConditionSource>,
        channel_capacity: usize,
    ) -> Self {
        let (channel, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            triggers: RwLock::new(HashMap::new()),
            invoker,
            events,
            channel,
            conditions,
        }
    }

    /// Add a trigger, replacing any with the same id, and start it when enabled.
    pub async fn add(&self, trigger: WorkflowTrigger) -> Result<(), EngineError> {
        check(&trigger)?;

        let mut triggers = self.triggers.write().await;
        let fired = match triggers.remove(&trigger.id) {
            Some(mut previous) => {
                tracing::info!("Replacing trigger {}", trigger.id);
                previous.stop();
                previous.fired
            }
            None => Arc::new(AtomicU64::new(0)),
        };
        let active = self.activate(trigger.clone(), fired);
        triggers.insert(trigger.id.clone(), active);
        drop(triggers);

        tracing::info!(
            "Added {} trigger {} for workflow {}",
            trigger.kind.as_str(),
            trigger.id,
            trigger.workflow_id
        );
        self.events.emit(EngineEvent::TriggerAdded {
            trigger_id: trigger.id,
            workflow_id: trigger.workflow_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Stop and forget a trigger
    pub async fn remove(&self, trigger_id: &str) -> Result<WorkflowTrigger, EngineError> {
        let mut active = self
            .triggers
            .write()
            .await
            .remove(trigger_id)
            .ok_or_else(|| EngineError::TriggerNotFound(trigger_id.to_string()))?;
        active.stop();

        tracing::info!("Removed trigger {}", trigger_id);
        self.events.emit(EngineEvent::TriggerRemoved {
            trigger_id: active.spec.id.clone(),
            workflow_id: active.spec.workflow_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(active.spec)
    }

    /// Remove every trigger that targets `workflow_id`
    pub async fn remove_for_workflow(&self, workflow_id: &str) -> Vec<TriggerId> {
        let ids: Vec<TriggerId> = self
            .triggers
            .read()
            .await
            .values()
            .filter(|t| t.spec.workflow_id == workflow_id)
            .map(|t| t.spec.id.clone())
            .collect();
        for id in &ids {
            let _ = self.remove(id).await;
        }
        ids
    }

    /// Start or stop a trigger without forgetting it
    pub async fn set_enabled(&self, trigger_id: &str, enabled: bool) -> Result<(), EngineError> {
        let mut triggers = self.triggers.write().await;
        let active = triggers
            .get_mut(trigger_id)
            .ok_or_else(|| EngineError::TriggerNotFound(trigger_id.to_string()))?;
        if active.spec.enabled == enabled {
            return Ok(());
        }

        active.stop();
        let mut spec = active.spec.clone();
        spec.enabled = enabled;
        *active = self.activate(spec, active.fired.clone());
        tracing::info!(
            "Trigger {} {}",
            trigger_id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub async fn get(&self, trigger_id: &str) -> Option<WorkflowTrigger> {
        self.triggers
            .read()
            .await
            .get(trigger_id)
            .map(|t| t.spec.clone())
    }

    /// How many executions a trigger has started
    pub async fn fire_count(&self, trigger_id: &str) -> Option<u64> {
        self.triggers
            .read()
            .await
            .get(trigger_id)
            .map(|t| t.fired.load(Ordering::SeqCst))
    }

    pub async fn list(&self) -> Vec<WorkflowTrigger> {
        let mut triggers: Vec<WorkflowTrigger> = self
            .triggers
            .read()
            .await
            .values()
            .map(|t| t.spec.clone())
            .collect();
        triggers.sort_by(|a, b| a.id.cmp(&b.id));
        triggers
    }

    pub async fn list_for_workflow(&self, workflow_id: &WorkflowId) -> Vec<WorkflowTrigger> {
        self.list()
            .await
            .into_iter()
            .filter(|t| &t.workflow_id == workflow_id)
            .collect()
    }

    /// Deliver a message to event triggers; returns how many listeners saw it
    pub fn publish(&self, message: EventMessage) -> usize {
        tracing::debug!("Publishing event on channel {}", message.channel);
        self.channel.send(message).unwrap_or(0)
    }

    /// Stop every trigger task
    pub async fn shutdown(&self) {
        let mut triggers = self.triggers.write().await;
        for active in triggers.values_mut() {
            active.abort();
        }
        triggers.clear();
    }

    fn activate(&self, spec: WorkflowTrigger, fired: Arc<AtomicU64>) -> ActiveTrigger {
        let cancel = CancellationToken::new();
        let task = if spec.enabled {
            Some(self.spawn(spec.clone(), cancel.clone(), fired.clone()))
        } else {
            None
        };
        ActiveTrigger {
            spec,
            cancel,
            task,
            fired,
        }
    }

    fn spawn(
        &self,
        trigger: WorkflowTrigger,
        cancel: CancellationToken,
        fired: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        let kind = trigger.kind.clone();
        let task = TriggerTask {
            trigger,
            invoker: self.invoker.clone(),
            events: self.events.clone(),
            cancel,
            fired,
        };

        match kind {
            TriggerKind::Schedule(spec) => tokio::spawn(run_schedule(task, spec)),
            TriggerKind::Event(spec) => {
                // subscribe now so events published right after `add` are seen
                let messages = self.channel.subscribe();
                tokio::spawn(event::run(task, spec, messages))
            }
            TriggerKind::Condition(spec) => {
                tokio::spawn(condition::run(task, spec, self.conditions.clone()))
            }
        }
    }
}

impl Drop for TriggerManager {
    fn drop(&mut self) {
        for active in self.triggers.get_mut().values_mut() {
            active.abort();
        }
    }
}

/// Reject triggers whose configuration can never work
fn check(trigger: &WorkflowTrigger) -> Result<(), EngineError> {
    if trigger.id.trim().is_empty() {
        return Err(EngineError::Trigger("trigger id is empty".to_string()));
    }
    match &trigger.kind {
        TriggerKind::Schedule(spec) => {
            spec.expression
                .parse::<Schedule>()
                .map_err(|e| EngineError::Trigger(e.to_string()))?;
            if let (Some(start), Some(end)) = (spec.start_at, spec.end_at) {
                if end <= start {
                    return Err(EngineError::Trigger(format!(
                        "trigger {} ends before it starts",
                        trigger.id
                    )));
                }
            }
        }
        TriggerKind::Event(spec) => {
            if spec.channel.is_empty() {
                return Err(EngineError::Trigger("event channel is empty".to_string()));
            }
        }
        TriggerKind::Condition(spec) => {
            if spec.conditions.is_empty() {
                return Err(EngineError::Trigger(format!(
                    "condition trigger {} has no conditions",
                    trigger.id
                )));
            }
            for condition in &spec.conditions {
                condition
                    .validate()
                    .map_err(|e| EngineError::Trigger(e.to_string()))?;
            }
        }
    }
    Ok(())
}

async fn run_schedule(task: TriggerTask, spec: ScheduleTrigger) {
    let schedule = match spec.expression.parse::<Schedule>() {
        Ok(schedule) => schedule,
        Err(e) => {
            task.report(e.to_string());
            return;
        }
    };

    let mut from = match spec.start_at {
        Some(start) if start > Utc::now() => start,
        _ => Utc::now(),
    };

    loop {
        let fired = task.fired.load(Ordering::SeqCst);
        if spec.max_executions.is_some_and(|max| fired >= max) {
            tracing::info!("Trigger {} reached its execution limit", task.trigger.id);
            return;
        }
        let Some(next) = schedule.next_after(from) else {
            task.report(format!("schedule '{}' has no time after {}", spec.expression, from));
            return;
        };
        if spec.end_at.is_some_and(|end| next > end) {
            tracing::info!("Trigger {} schedule window has closed", task.trigger.id);
            return;
        }

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = sleep(wait) => {}
            _ = task.cancel.cancelled() => return,
        }

        task.fire(Variables::new()).await;
        from = next.max(Utc::now());
    }
}
