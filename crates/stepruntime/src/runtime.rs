use crate::executor::{ExecutionHandle, WorkflowExecutor};
use crate::metrics::WorkflowMetrics;
use crate::registry::ExecutorRegistry;
use crate::triggers::{FactStore, TriggerManager, WorkflowInvoker};
use crate::validation::{validate_workflow, ValidationResult};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use stepcore::{
    EngineError, EngineEvent, EventBus, EventMessage, ExecutionId, NodeExecutor, NodeSchema,
    Result, Value, Variables, WorkflowDefinition, WorkflowExecution, WorkflowId,
    WorkflowTrigger,
};
use tokio::sync::{broadcast, RwLock, Semaphore};

/// Configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Executions allowed to be pending, running or paused at once
    pub max_concurrent_executions: usize,
    pub event_buffer_size: usize,
    /// Used when neither the node nor the workflow sets a timeout
    pub default_node_timeout_ms: u64,
    /// Upper bound on node visits per execution, for cyclic graphs
    pub max_node_visits: usize,
    /// Finished executions kept for queries and metrics
    pub max_execution_history: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            event_buffer_size: 1000,
            default_node_timeout_ms: 30_000,
            max_node_visits: 10_000,
            max_execution_history: 1000,
        }
    }
}

/// A request to start one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub input: Variables,
    #[serde(default = "manual")]
    pub triggered_by: String,
    #[serde(default)]
    pub parent_execution_id: Option<ExecutionId>,
}

fn manual() -> String {
    "manual".to_string()
}

impl ExecutionRequest {
    pub fn new(workflow_id: impl Into<WorkflowId>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            input: Variables::new(),
            triggered_by: manual(),
            parent_execution_id: None,
        }
    }

    pub fn with_input(mut self, input: Variables) -> Self {
        self.input = input;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input.insert(key.into(), value.into());
        self
    }

    pub fn triggered_by(mut self, source: impl Into<String>) -> Self {
        self.triggered_by = source.into();
        self
    }

    pub fn with_parent(mut self, parent: ExecutionId) -> Self {
        self.parent_execution_id = Some(parent);
        self
    }
}

/// Execution handles in creation order
#[derive(Default)]
struct ExecutionStore {
    by_id: HashMap<ExecutionId, Arc<ExecutionHandle>>,
    order: VecDeque<ExecutionId>,
}

impl ExecutionStore {
    fn insert(&mut self, handle: Arc<ExecutionHandle>) {
        self.order.push_back(handle.execution_id);
        self.by_id.insert(handle.execution_id, handle);
    }

    /// Drop the oldest finished executions beyond `keep`
    fn prune(&mut self, keep: usize) -> usize {
        let finished: Vec<ExecutionId> = self
            .order
            .iter()
            .filter(|id| self.by_id.get(id).is_some_and(|h| h.status().is_terminal()))
            .copied()
            .collect();
        if finished.len() <= keep {
            return 0;
        }

        let excess_count = finished.len() - keep;
        let excess: HashSet<ExecutionId> = finished.into_iter().take(excess_count).collect();
        self.order.retain(|id| !excess.contains(id));
        for id in &excess {
            self.by_id.remove(id);
        }
        excess.len()
    }
}

struct EngineInner {
    config: RuntimeConfig,
    registry: RwLock<Arc<ExecutorRegistry>>,
    workflows: RwLock<HashMap<WorkflowId, Arc<WorkflowDefinition>>>,
    executions: RwLock<ExecutionStore>,
    executor: WorkflowExecutor,
    slots: Arc<Semaphore>,
    event_bus: Arc<EventBus>,
    triggers: TriggerManager,
    facts: FactStore,
}

/// Main entry point: owns definitions, executions, triggers and executors.
///
/// Cloning is cheap and every clone drives the same engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create an engine with default settings and no node executors
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(ExecutorRegistry::new(), config)
    }

    /// Create an engine with a pre-populated executor registry
    pub fn with_registry(registry: ExecutorRegistry, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let facts = FactStore::new();
        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| EngineInner {
            executor: WorkflowExecutor::new(&config),
            slots: Arc::new(Semaphore::new(config.max_concurrent_executions)),
            registry: RwLock::new(Arc::new(registry)),
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(ExecutionStore::default()),
            triggers: TriggerManager::new(
                Arc::new(EngineInvoker(weak.clone())),
                event_bus.clone(),
                Arc::new(facts.clone()),
                config.event_buffer_size,
            ),
            event_bus,
            facts,
            config,
        });
        Self { inner }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    // ---- executors -------------------------------------------------------

    /// Add or replace the executor for its node kind
    pub async fn register_node_executor(&self, executor: Arc<dyn NodeExecutor>) {
        let mut registry = self.inner.registry.write().await;
        let mut updated = ExecutorRegistry::clone(&registry);
        updated.register(executor);
        *registry = Arc::new(updated);
    }

    pub async fn node_kinds(&self) -> Vec<String> {
        self.inner.registry.read().await.list_kinds()
    }

    pub async fn node_schema(&self, kind: &str) -> Option<NodeSchema> {
        self.inner.registry.read().await.schema(kind)
    }

    // ---- workflows -------------------------------------------------------

    /// Check a definition without registering it
    pub async fn validate_workflow(&self, workflow: &WorkflowDefinition) -> ValidationResult {
        let registry = self.inner.registry.read().await.clone();
        validate_workflow(workflow, &registry)
    }

    /// Validate and store a definition, replacing one with the same id.
    ///
    /// Nothing is stored when validation finds errors. Warnings are returned
    /// in the result.
    pub async fn register_workflow(&self, workflow: WorkflowDefinition) -> Result<ValidationResult> {
        let result = self.validate_workflow(&workflow).await;
        if !result.valid {
            tracing::warn!(
                "Rejected workflow {}: {} validation errors",
                workflow.id,
                result.errors.len()
            );
            return Err(EngineError::InvalidWorkflow {
                workflow_id: workflow.id,
                errors: result.errors,
            });
        }
        for warning in &result.warnings {
            tracing::warn!("Workflow {}: {}", workflow.id, warning);
        }

        let workflow_id = workflow.id.clone();
        let version = workflow.version.clone();
        let replaced = self
            .inner
            .workflows
            .write()
            .await
            .insert(workflow_id.clone(), Arc::new(workflow))
            .is_some();

        tracing::info!(
            "{} workflow {} (version {})",
            if replaced { "Replaced" } else { "Registered" },
            workflow_id,
            version
        );
        self.inner.event_bus.emit(EngineEvent::WorkflowRegistered {
            workflow_id,
            version,
            warnings: result.warnings.clone(),
            timestamp: Utc::now(),
        });
        Ok(result)
    }

    /// Remove a definition, cancelling its live executions and its triggers
    pub async fn unregister_workflow(&self, workflow_id: &str) -> Result<()> {
        self.inner
            .workflows
            .write()
            .await
            .remove(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        let live: Vec<Arc<ExecutionHandle>> = self
            .handles()
            .await
            .into_iter()
            .filter(|h| h.workflow_id == workflow_id && !h.status().is_terminal())
            .collect();
        for handle in live {
            if handle.cancel().await.is_ok() {
                self.emit_cancelled(&handle);
            }
        }

        let removed = self.inner.triggers.remove_for_workflow(workflow_id).await;
        tracing::info!(
            "Unregistered workflow {} ({} triggers removed)",
            workflow_id,
            removed.len()
        );
        self.inner.event_bus.emit(EngineEvent::WorkflowUnregistered {
            workflow_id: workflow_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.inner
            .workflows
            .read()
            .await
            .get(workflow_id)
            .map(|w| WorkflowDefinition::clone(w))
    }

    /// All registered definitions, sorted by id
    pub async fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let mut workflows: Vec<WorkflowDefinition> = self
            .inner
            .workflows
            .read()
            .await
            .values()
            .map(|w| WorkflowDefinition::clone(w))
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    // ---- executions ------------------------------------------------------

    /// Start an execution and return its id without waiting for it
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Variables,
        triggered_by: &str,
    ) -> Result<ExecutionId> {
        self.execute(
            ExecutionRequest::new(workflow_id)
                .with_input(input)
                .triggered_by(triggered_by),
        )
        .await
    }

    /// Start an execution from a full request.
    ///
    /// The definition and executor registry are captured now; later
    /// re-registration does not affect this run. Fails immediately with
    /// `CapacityExceeded` when the concurrency ceiling is reached.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionId> {
        let definition = self
            .inner
            .workflows
            .read()
            .await
            .get(&request.workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(request.workflow_id.clone()))?;

        let slot = self
            .inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::CapacityExceeded {
                limit: self.inner.config.max_concurrent_executions,
            })?;

        let mut context = definition.variables.clone();
        context.extend(request.input);
        let mut record = WorkflowExecution::new(
            definition.id.clone(),
            definition.version.clone(),
            context,
            request.triggered_by,
        );
        record.parent_execution_id = request.parent_execution_id;
        record.metrics.total_nodes = definition.nodes.len();

        let handle = Arc::new(ExecutionHandle::new(record, slot));
        let execution_id = handle.execution_id;
        self.inner.executions.write().await.insert(handle.clone());

        let registry = self.inner.registry.read().await.clone();
        let engine = self.clone();
        tokio::spawn(async move {
            let inner = &engine.inner;
            inner
                .executor
                .execute(definition, registry, inner.event_bus.clone(), handle)
                .await;
            engine.prune_history().await;
        });

        Ok(execution_id)
    }

    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> Result<()> {
        let handle = self.handle(execution_id).await?;
        handle.cancel().await?;
        tracing::info!("Cancelled execution {}", execution_id);
        self.emit_cancelled(&handle);
        Ok(())
    }

    /// Park a running execution before its next node
    pub async fn pause_execution(&self, execution_id: ExecutionId) -> Result<()> {
        let handle = self.handle(execution_id).await?;
        handle.pause().await?;
        tracing::info!("Paused execution {}", execution_id);
        self.inner.event_bus.emit(EngineEvent::ExecutionPaused {
            execution_id,
            workflow_id: handle.workflow_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub async fn resume_execution(&self, execution_id: ExecutionId) -> Result<()> {
        let handle = self.handle(execution_id).await?;
        handle.resume().await?;
        tracing::info!("Resumed execution {}", execution_id);
        self.inner.event_bus.emit(EngineEvent::ExecutionResumed {
            execution_id,
            workflow_id: handle.workflow_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Wait until the execution is completed, failed or cancelled
    pub async fn wait_for_execution(&self, execution_id: ExecutionId) -> Result<WorkflowExecution> {
        let handle = self.handle(execution_id).await?;
        Ok(handle.wait().await)
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Option<WorkflowExecution> {
        let handle = self.handle(execution_id).await.ok()?;
        Some(handle.snapshot().await)
    }

    /// Retained executions of one workflow, oldest first
    pub async fn get_executions_by_workflow(&self, workflow_id: &str) -> Vec<WorkflowExecution> {
        let mut executions = Vec::new();
        for handle in self.handles().await {
            if handle.workflow_id == workflow_id {
                executions.push(handle.snapshot().await);
            }
        }
        executions
    }

    /// Executions that have not finished: pending, running or paused
    pub async fn get_running_executions(&self) -> Vec<WorkflowExecution> {
        let mut executions = Vec::new();
        for handle in self.handles().await {
            if !handle.status().is_terminal() {
                executions.push(handle.snapshot().await);
            }
        }
        executions
    }

    pub async fn get_workflow_metrics(&self, workflow_id: &str) -> WorkflowMetrics {
        let executions = self.get_executions_by_workflow(workflow_id).await;
        WorkflowMetrics::from_executions(workflow_id, &executions)
    }

    async fn handle(&self, execution_id: ExecutionId) -> Result<Arc<ExecutionHandle>> {
        self.inner
            .executions
            .read()
            .await
            .by_id
            .get(&execution_id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    async fn handles(&self) -> Vec<Arc<ExecutionHandle>> {
        let store = self.inner.executions.read().await;
        store
            .order
            .iter()
            .filter_map(|id| store.by_id.get(id).cloned())
            .collect()
    }

    async fn prune_history(&self) {
        let pruned = self
            .inner
            .executions
            .write()
            .await
            .prune(self.inner.config.max_execution_history);
        if pruned > 0 {
            tracing::debug!("Pruned {} finished executions from history", pruned);
        }
    }

    fn emit_cancelled(&self, handle: &ExecutionHandle) {
        self.inner.event_bus.emit(EngineEvent::ExecutionCancelled {
            execution_id: handle.execution_id,
            workflow_id: handle.workflow_id.clone(),
            timestamp: Utc::now(),
        });
    }

    // ---- triggers --------------------------------------------------------

    /// Add a trigger; it starts immediately when enabled.
    ///
    /// The target workflow does not have to exist yet. Fires against a
    /// missing workflow surface as `TriggerError` events.
    pub async fn add_trigger(&self, trigger: WorkflowTrigger) -> Result<()> {
        self.inner.triggers.add(trigger).await
    }

    pub async fn remove_trigger(&self, trigger_id: &str) -> Result<WorkflowTrigger> {
        self.inner.triggers.remove(trigger_id).await
    }

    pub async fn set_trigger_enabled(&self, trigger_id: &str, enabled: bool) -> Result<()> {
        self.inner.triggers.set_enabled(trigger_id, enabled).await
    }

    pub async fn get_trigger(&self, trigger_id: &str) -> Option<WorkflowTrigger> {
        self.inner.triggers.get(trigger_id).await
    }

    pub async fn list_triggers(&self) -> Vec<WorkflowTrigger> {
        self.inner.triggers.list().await
    }

    pub async fn list_triggers_for(&self, workflow_id: &str) -> Vec<WorkflowTrigger> {
        self.inner
            .triggers
            .list_for_workflow(&workflow_id.to_string())
            .await
    }

    /// Publish to the external channel read by event triggers.
    ///
    /// Returns the number of event triggers that received the message.
    pub fn publish_event(&self, channel: impl Into<String>, payload: Variables) -> usize {
        self.inner
            .triggers
            .publish(EventMessage::new(channel, payload))
    }

    /// Facts polled by condition triggers
    pub fn facts(&self) -> &FactStore {
        &self.inner.facts
    }

    // ---- events & lifecycle ----------------------------------------------

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.event_bus
    }

    /// Stop all triggers and cancel every unfinished execution
    pub async fn shutdown(&self) {
        self.inner.triggers.shutdown().await;
        for handle in self.handles().await {
            if handle.cancel().await.is_ok() {
                self.emit_cancelled(&handle);
            }
        }
        tracing::info!("Engine shut down");
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Lets trigger tasks start executions without keeping the engine alive
struct EngineInvoker(Weak<EngineInner>);

#[async_trait]
impl WorkflowInvoker for EngineInvoker {
    async fn invoke(
        &self,
        workflow_id: &str,
        input: Variables,
        triggered_by: String,
    ) -> Result<ExecutionId> {
        let inner = self
            .0
            .upgrade()
            .ok_or_else(|| EngineError::Trigger("engine has shut down".to_string()))?;
        WorkflowEngine { inner }
            .execute_workflow(workflow_id, input, &triggered_by)
            .await
    }
}
