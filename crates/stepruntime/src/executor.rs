use crate::registry::ExecutorRegistry;
use crate::runtime::RuntimeConfig;
use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stepcore::{
    EdgeType, EngineError, EngineEvent, ErrorCategory, ErrorHandling, EventBus, ExecutionId,
    ExecutionStatus, NodeContext, NodeError, NodeExecutor, NodeId, NodeKind, NodeOutput, StepStatus,
    Variables, WorkflowDefinition, WorkflowError, WorkflowExecution, WorkflowId, WorkflowNode,
};
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Live state of one execution, shared by its walk task and the engine
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    record: RwLock<WorkflowExecution>,
    cancellation: CancellationToken,
    status: watch::Sender<ExecutionStatus>,
    slot: Mutex<Option<OwnedSemaphorePermit>>,
}

impl ExecutionHandle {
    pub(crate) fn new(record: WorkflowExecution, slot: OwnedSemaphorePermit) -> Self {
        let (status, _) = watch::channel(record.status);
        Self {
            execution_id: record.id,
            workflow_id: record.workflow_id.clone(),
            record: RwLock::new(record),
            cancellation: CancellationToken::new(),
            status,
            slot: Mutex::new(Some(slot)),
        }
    }

    /// Copy of the execution record as it stands now
    pub async fn snapshot(&self) -> WorkflowExecution {
        self.record.read().await.clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Wait until the execution reaches a terminal status
    pub async fn wait(&self) -> WorkflowExecution {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        self.snapshot().await
    }

    pub(crate) async fn cancel(&self) -> Result<(), EngineError> {
        self.transition(
            &[ExecutionStatus::Pending, ExecutionStatus::Running, ExecutionStatus::Paused],
            ExecutionStatus::Cancelled,
        )
        .await?;
        self.cancellation.cancel();
        self.release_slot();
        Ok(())
    }

    pub(crate) async fn pause(&self) -> Result<(), EngineError> {
        self.transition(&[ExecutionStatus::Running], ExecutionStatus::Paused)
            .await
    }

    pub(crate) async fn resume(&self) -> Result<(), EngineError> {
        self.transition(&[ExecutionStatus::Paused], ExecutionStatus::Running)
            .await
    }

    async fn transition(&self, allowed: &[ExecutionStatus], to: ExecutionStatus) -> Result<(), EngineError> {
        let mut record = self.record.write().await;
        if !allowed.contains(&record.status) {
            return Err(EngineError::InvalidTransition {
                execution_id: self.execution_id,
                from: record.status,
                to,
            });
        }
        if to.is_terminal() {
            record.finish(to);
        } else {
            record.status = to;
        }
        self.status.send_replace(to);
        Ok(())
    }

    fn release_slot(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }

    /// Gate between node steps: `false` once cancelled, parks while paused.
    async fn checkpoint(&self) -> bool {
        let mut rx = self.status.subscribe();
        loop {
            if self.cancellation.is_cancelled() {
                return false;
            }
            if *rx.borrow_and_update() != ExecutionStatus::Paused {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = self.cancellation.cancelled() => return false,
            }
        }
    }

    async fn begin_step(&self, node: &WorkflowNode, input: &Variables) -> usize {
        let mut record = self.record.write().await;
        record.current_node = Some(node.id.clone());
        record
            .steps
            .push(stepcore::ExecutionStep::begin(&node.id, &node.name, input.clone()));
        record.steps.len() - 1
    }

    async fn record_retry(&self, step: usize, retry_count: u32) {
        let mut record = self.record.write().await;
        record.metrics.retries += 1;
        if let Some(step) = record.steps.get_mut(step) {
            step.retry_count = retry_count;
        }
    }

    async fn complete_step(&self, step: usize, node_id: &str, output: &NodeOutput) {
        let mut record = self.record.write().await;
        record.metrics.successful_nodes += 1;
        record
            .context
            .extend(output.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        record
            .context
            .insert(output_key(node_id), output.output.clone());
        if let Some(step) = record.steps.get_mut(step) {
            step.complete(output.output.clone());
        }
    }

    async fn fail_step(&self, step: usize, error: WorkflowError) {
        let mut record = self.record.write().await;
        record.metrics.failed_nodes += 1;
        record.errors.push(error.clone());
        if let Some(step) = record.steps.get_mut(step) {
            step.fail(error);
        }
    }

    async fn abandon_step(&self, step: usize) {
        let mut record = self.record.write().await;
        if let Some(step) = record.steps.get_mut(step) {
            step.status = StepStatus::Skipped;
            step.ended_at = Some(Utc::now());
        }
    }
}

/// Context key under which a node's output is stored
pub fn output_key(node_id: &str) -> String {
    format!("{}_output", node_id)
}

/// Why a path stopped early
enum Halt {
    Failed(WorkflowError),
    Cancelled,
}

/// Context after a path, plus the merge nodes it stopped at
type WalkResult = Result<(Variables, Vec<NodeId>), Halt>;

struct Visit {
    vars: Variables,
    next: Vec<NodeId>,
    stop: bool,
}

/// Walks workflow graphs, one execution per `execute` call
pub struct WorkflowExecutor {
    default_node_timeout: Duration,
    max_node_visits: usize,
}

impl WorkflowExecutor {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            default_node_timeout: Duration::from_millis(config.default_node_timeout_ms),
            max_node_visits: config.max_node_visits,
        }
    }

    /// Run the execution behind `handle` to a terminal state.
    ///
    /// Failures are recorded on the execution and published as events;
    /// nothing is returned to the caller.
    pub async fn execute(
        &self,
        definition: Arc<WorkflowDefinition>,
        registry: Arc<ExecutorRegistry>,
        event_bus: Arc<EventBus>,
        handle: Arc<ExecutionHandle>,
    ) {
        let context = {
            let mut record = handle.record.write().await;
            if record.status != ExecutionStatus::Pending {
                // cancelled before it got going
                return;
            }
            record.status = ExecutionStatus::Running;
            handle.status.send_replace(ExecutionStatus::Running);
            record.context.clone()
        };

        tracing::info!(
            "Starting workflow execution {} of {}",
            handle.execution_id,
            definition.id
        );
        event_bus.emit(EngineEvent::ExecutionStarted {
            execution_id: handle.execution_id,
            workflow_id: definition.id.clone(),
            triggered_by: handle.snapshot().await.triggered_by,
            timestamp: Utc::now(),
        });

        let walk = Walk {
            executor: self,
            definition: &definition,
            registry: &registry,
            events: &event_bus,
            handle: &handle,
            visits: AtomicUsize::new(0),
        };

        let mut outcome = match definition.start_node() {
            Some(start) => walk
                .walk(start.id.clone(), context, false, false)
                .await
                .map(|(vars, _)| vars),
            None => Err(Halt::Failed(WorkflowError::new(
                ErrorCategory::System,
                "missing_start",
                "workflow has no start node",
            ))),
        };

        // a pause that lands after the last node still holds completion
        loop {
            outcome = match outcome {
                Ok(_) if !handle.checkpoint().await => Err(Halt::Cancelled),
                other => other,
            };
            match self.finish(&definition, &event_bus, &handle, outcome).await {
                Some(vars) => outcome = Ok(vars),
                None => break,
            }
        }
    }

    /// Record the outcome and release the slot.
    ///
    /// Hands the variables back when a pause got in after the last
    /// checkpoint; the caller parks again and retries.
    async fn finish(
        &self,
        definition: &WorkflowDefinition,
        event_bus: &EventBus,
        handle: &ExecutionHandle,
        outcome: Result<Variables, Halt>,
    ) -> Option<Variables> {
        let mut record = handle.record.write().await;
        let event = match outcome {
            Ok(vars) if record.status == ExecutionStatus::Paused => return Some(vars),
            Ok(vars) if record.status == ExecutionStatus::Running => {
                record.context = vars;
                record.finish(ExecutionStatus::Completed);
                tracing::info!(
                    "Execution {} completed in {}ms",
                    handle.execution_id,
                    record.metrics.duration_ms.unwrap_or(0)
                );
                Some(EngineEvent::ExecutionCompleted {
                    execution_id: handle.execution_id,
                    workflow_id: definition.id.clone(),
                    duration_ms: record.metrics.duration_ms.unwrap_or(0),
                    timestamp: Utc::now(),
                })
            }
            Err(Halt::Failed(error)) if !record.status.is_terminal() => {
                if !record.errors.iter().any(|e| e.id == error.id) {
                    record.errors.push(error.clone());
                }
                record.finish(ExecutionStatus::Failed);
                tracing::error!("Execution {} failed: {}", handle.execution_id, error);
                Some(EngineEvent::ExecutionFailed {
                    execution_id: handle.execution_id,
                    workflow_id: definition.id.clone(),
                    error: error.to_string(),
                    timestamp: Utc::now(),
                })
            }
            _ => None,
        };
        let status = record.status;
        drop(record);

        // slot and event go out before waiters see the terminal status
        handle.release_slot();
        if let Some(event) = event {
            event_bus.emit(event);
        }
        handle.status.send_replace(status);
        None
    }
}

/// Per-execution walk state
struct Walk<'a> {
    executor: &'a WorkflowExecutor,
    definition: &'a WorkflowDefinition,
    registry: &'a ExecutorRegistry,
    events: &'a EventBus,
    handle: &'a ExecutionHandle,
    visits: AtomicUsize,
}

impl<'a> Walk<'a> {
    /// Walk from `start` until every path from it ends.
    ///
    /// Successors go on a worklist, so a long cycle runs in a flat loop; only
    /// `parallel` forks recurse, one level per nested fork. Inside a parallel
    /// branch (`stop_at_merge`) a path stops on reaching a merge node and
    /// reports it instead; `at_join` enters that merge node once all branches
    /// are done.
    fn walk<'s>(
        &'s self,
        start: NodeId,
        vars: Variables,
        stop_at_merge: bool,
        at_join: bool,
    ) -> BoxFuture<'s, WalkResult> {
        async move {
            let mut vars = vars;
            let mut pending = vec![(start, at_join)];
            let mut arrivals = Vec::new();

            while let Some((node_id, joining)) = pending.pop() {
                let node = self.definition.find_node(&node_id).ok_or_else(|| {
                    Halt::Failed(
                        WorkflowError::new(
                            ErrorCategory::System,
                            "node_not_found",
                            format!("node '{}' does not exist", node_id),
                        )
                        .with_node(node_id.clone()),
                    )
                })?;

                if stop_at_merge && !joining && node.kind() == NodeKind::Merge {
                    extend_unique(&mut arrivals, vec![node_id]);
                    continue;
                }

                let visit = self.run_node(node, vars).await?;
                vars = visit.vars;
                if visit.stop || visit.next.is_empty() {
                    continue;
                }

                // reversed so the first successor is walked first
                if node.kind() == NodeKind::Parallel {
                    let (merged, join_points) = self.fork_join(visit.next, vars).await?;
                    vars = merged;
                    pending.extend(join_points.into_iter().rev().map(|merge| (merge, true)));
                } else {
                    pending.extend(visit.next.into_iter().rev().map(|next| (next, false)));
                }
            }

            Ok((vars, arrivals))
        }
        .boxed()
    }

    /// Run each branch on its own copy of `vars` and merge what they changed.
    ///
    /// Returns the merged context and the merge nodes the branches stopped at.
    async fn fork_join(&self, branches: Vec<NodeId>, vars: Variables) -> WalkResult {
        tracing::debug!("Forking {} parallel branches", branches.len());
        let results = join_all(
            branches
                .into_iter()
                .map(|branch| self.walk(branch, vars.clone(), true, false)),
        )
        .await;

        let mut merged = vars.clone();
        let mut join_points = Vec::new();
        let mut halt = None;
        for result in results {
            match result {
                Ok((branch_vars, reached)) => {
                    for (key, value) in branch_vars {
                        if vars.get(&key) != Some(&value) {
                            merged.insert(key, value);
                        }
                    }
                    extend_unique(&mut join_points, reached);
                }
                Err(h) => {
                    // keep the first failure; cancellation only if nothing failed
                    if !matches!(halt, Some(Halt::Failed(_))) {
                        halt = Some(h);
                    }
                }
            }
        }
        match halt {
            Some(halt) => Err(halt),
            None => Ok((merged, join_points)),
        }
    }

    /// Execute one node with timeout, retries and its error policy
    async fn run_node(&self, node: &WorkflowNode, mut vars: Variables) -> Result<Visit, Halt> {
        if self.visits.fetch_add(1, Ordering::SeqCst) >= self.executor.max_node_visits {
            return Err(Halt::Failed(
                WorkflowError::new(
                    ErrorCategory::System,
                    "visit_limit_exceeded",
                    format!(
                        "more than {} node visits; the graph may loop forever",
                        self.executor.max_node_visits
                    ),
                )
                .with_node(node.id.clone()),
            ));
        }
        if !self.handle.checkpoint().await {
            return Err(Halt::Cancelled);
        }

        let kind = node.kind();
        let step = self.handle.begin_step(node, &vars).await;
        tracing::debug!("Executing node {} ({})", node.id, kind);
        self.events.emit(EngineEvent::NodeStarted {
            execution_id: self.handle.execution_id,
            node_id: node.id.clone(),
            node_kind: kind.to_string(),
            timestamp: Utc::now(),
        });

        let result = match self.registry.get(kind.as_str()) {
            Ok(executor) => self.attempt_with_retries(executor.as_ref(), node, &vars, step).await,
            Err(e) => {
                let error = WorkflowError::from_node_error(&node.id, &e);
                self.fail(node, step, &error).await;
                return Err(Halt::Failed(error));
            }
        };

        match result {
            Ok(output) => {
                vars.extend(output.variables.clone());
                vars.insert(output_key(&node.id), output.output.clone());
                self.handle.complete_step(step, &node.id, &output).await;

                let duration_ms = self
                    .handle
                    .record
                    .read()
                    .await
                    .steps
                    .get(step)
                    .and_then(|s| s.duration_ms)
                    .unwrap_or(0);
                tracing::debug!("Node {} completed in {}ms", node.id, duration_ms);
                self.events.emit(EngineEvent::NodeCompleted {
                    execution_id: self.handle.execution_id,
                    node_id: node.id.clone(),
                    output: output.output,
                    duration_ms,
                    timestamp: Utc::now(),
                });

                let next = match output.next_nodes {
                    Some(next) => next,
                    None => self.follow_edges(node, &vars, None),
                };
                Ok(Visit {
                    vars,
                    next,
                    stop: output.stop,
                })
            }
            Err(None) => {
                self.handle.abandon_step(step).await;
                Err(Halt::Cancelled)
            }
            Err(Some(error)) => {
                self.fail(node, step, &error).await;

                let mode = node
                    .metadata
                    .error_handling
                    .unwrap_or(self.definition.settings.error_handling);
                match (mode, node.metadata.fallback_node.as_ref()) {
                    (ErrorHandling::Continue, _) => {
                        tracing::warn!("Node {} failed, continuing: {}", node.id, error.message);
                        let next = self.follow_edges(node, &vars, Some(&error));
                        Ok(Visit {
                            vars,
                            next,
                            stop: false,
                        })
                    }
                    (ErrorHandling::Fallback | ErrorHandling::Retry, Some(fallback)) => {
                        tracing::warn!("Node {} failed, falling back to {}", node.id, fallback);
                        Ok(Visit {
                            vars,
                            next: vec![fallback.clone()],
                            stop: false,
                        })
                    }
                    _ => Err(Halt::Failed(error)),
                }
            }
        }
    }

    /// `Err(None)` means the execution was cancelled mid-step.
    async fn attempt_with_retries(
        &self,
        executor: &dyn NodeExecutor,
        node: &WorkflowNode,
        vars: &Variables,
        step: usize,
    ) -> Result<NodeOutput, Option<WorkflowError>> {
        let settings = &self.definition.settings;
        let max_retries = node.metadata.max_retries.unwrap_or(settings.max_retries);
        let limit = node
            .metadata
            .timeout_ms
            .or(settings.default_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.executor.default_node_timeout);

        let mut retries = 0u32;
        loop {
            let error = match self.attempt(executor, node, vars, limit).await {
                Ok(output) => return Ok(output),
                Err(NodeError::Cancelled) if self.handle.is_cancelled() => return Err(None),
                Err(e) => WorkflowError::from_node_error(&node.id, &e),
            };

            if !error.retryable || retries >= max_retries {
                return Err(Some(error));
            }

            retries += 1;
            let delay = backoff(settings.retry_delay_ms, retries);
            self.handle.record_retry(step, retries).await;
            tracing::warn!(
                "Node {} attempt {}/{} failed: {}. Retrying in {}ms",
                node.id,
                retries,
                max_retries + 1,
                error.message,
                delay.as_millis()
            );
            self.events.emit(EngineEvent::NodeRetrying {
                execution_id: self.handle.execution_id,
                node_id: node.id.clone(),
                attempt: retries,
                delay_ms: delay.as_millis() as u64,
                timestamp: Utc::now(),
            });

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.handle.cancellation.cancelled() => return Err(None),
            }
        }
    }

    async fn attempt(
        &self,
        executor: &dyn NodeExecutor,
        node: &WorkflowNode,
        vars: &Variables,
        limit: Duration,
    ) -> Result<NodeOutput, NodeError> {
        let token = self.handle.cancellation.child_token();
        let ctx = NodeContext {
            execution_id: self.handle.execution_id,
            workflow_id: self.definition.id.clone(),
            node_id: node.id.clone(),
            variables: vars.clone(),
            events: self.events.create_emitter(self.handle.execution_id, node.id.clone()),
            cancellation: token.clone(),
        };

        let run = AssertUnwindSafe(executor.execute(node, ctx)).catch_unwind();
        let result = tokio::select! {
            result = timeout(limit, run) => match result {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(NodeError::Panicked(panic_message(panic.as_ref()))),
                Err(_) => Err(NodeError::Timeout {
                    millis: limit.as_millis() as u64,
                }),
            },
            _ = token.cancelled() => Err(NodeError::Cancelled),
        };
        // anything the executor spawned should stop with the attempt
        token.cancel();
        result
    }

    async fn fail(&self, node: &WorkflowNode, step: usize, error: &WorkflowError) {
        tracing::error!("Node {} failed: {}", node.id, error.message);
        self.handle.fail_step(step, error.clone()).await;
        self.events.emit(EngineEvent::NodeFailed {
            execution_id: self.handle.execution_id,
            node_id: node.id.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Targets of the outgoing edges that apply.
    ///
    /// After a tolerated failure, `error` edges (and `timeout` edges for
    /// timeouts) win when present; otherwise the regular edges are used.
    fn follow_edges(&self, node: &WorkflowNode, vars: &Variables, failure: Option<&WorkflowError>) -> Vec<NodeId> {
        let edges: Vec<_> = self.definition.outgoing(&node.id).collect();

        if let Some(error) = failure {
            let timed_out = error.category == ErrorCategory::Timeout;
            let recovery: Vec<NodeId> = edges
                .iter()
                .filter(|e| {
                    e.edge_type == EdgeType::Error || (timed_out && e.edge_type == EdgeType::Timeout)
                })
                .map(|e| e.target.clone())
                .collect();
            if !recovery.is_empty() {
                return recovery;
            }
        }

        edges
            .into_iter()
            .filter(|edge| match edge.edge_type {
                EdgeType::Default => true,
                EdgeType::Conditional => match &edge.condition {
                    None => true,
                    Some(condition) => condition.evaluate(vars).unwrap_or_else(|e| {
                        tracing::warn!(
                            "Condition on edge {} -> {} failed: {}",
                            edge.source,
                            edge.target,
                            e
                        );
                        false
                    }),
                },
                EdgeType::Error | EdgeType::Timeout => false,
            })
            .map(|edge| edge.target.clone())
            .collect()
    }
}

fn extend_unique(into: &mut Vec<NodeId>, items: Vec<NodeId>) {
    for item in items {
        if !into.contains(&item) {
            into.push(item);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Exponential backoff: `base × 2^(attempt-1)`
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
}
