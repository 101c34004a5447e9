use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stepcore::{
    Condition, EdgeType, EngineError, EngineEvent, ErrorCategory, ErrorHandling, ExecutionId,
    ExecutionStatus, NodeConfig, NodeContext, NodeError, NodeExecutor, NodeOutput, StepStatus,
    Value, Variables,
    WorkflowDefinition, WorkflowEdge, WorkflowExecution, WorkflowNode, WorkflowSettings,
    WorkflowTrigger,
};
use stepnodes::{register_with_actions, ActionExecutor, ActionHandler, FnAction};
use stepruntime::{ExecutorRegistry, RuntimeConfig, WorkflowEngine};

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn engine_with(actions: ActionExecutor, config: RuntimeConfig) -> WorkflowEngine {
    let mut registry = ExecutorRegistry::new();
    register_with_actions(&mut registry, actions);
    WorkflowEngine::with_registry(registry, config)
}

fn engine() -> WorkflowEngine {
    engine_with(ActionExecutor::with_builtins(), RuntimeConfig::default())
}

fn fast_settings() -> WorkflowSettings {
    WorkflowSettings {
        retry_delay_ms: 5,
        ..WorkflowSettings::default()
    }
}

/// start -> nodes... -> end
fn linear(id: &str, nodes: Vec<WorkflowNode>) -> WorkflowDefinition {
    let mut wf = WorkflowDefinition::new(id, id).with_settings(fast_settings());
    let mut previous = wf.add_node(WorkflowNode::start("start"));
    for node in nodes {
        let id = wf.add_node(node);
        wf.connect(previous, id.clone());
        previous = id;
    }
    wf.add_node(WorkflowNode::end("end"));
    wf.connect(previous, "end");
    wf
}

fn log(id: &str) -> WorkflowNode {
    WorkflowNode::action(id, "debug.log").with_param("message", format!("at {}", id))
}

fn set_var(id: &str, key: &str) -> WorkflowNode {
    let mut values = HashMap::new();
    values.insert(key.to_string(), Value::Bool(true));
    WorkflowNode::action(id, "variables.set").with_param("values", Value::Object(values))
}

/// Action that fails its first `failures` calls, counting every call
fn flaky(name: &str, calls: Arc<AtomicUsize>, failures: usize) -> impl ActionHandler + 'static {
    FnAction::new(name, move |_params: Variables, _ctx: NodeContext| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err(NodeError::ExecutionFailed(format!("attempt {} failed", n + 1)))
            } else {
                Ok(NodeOutput::new().with_output("ok"))
            }
        }
    })
}

fn path(execution: &WorkflowExecution) -> Vec<&str> {
    execution.steps.iter().map(|s| s.node_id.as_str()).collect()
}

async fn run(engine: &WorkflowEngine, workflow_id: &str, input: Variables) -> WorkflowExecution {
    let id = engine
        .execute_workflow(workflow_id, input, "test")
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), engine.wait_for_execution(id))
        .await
        .expect("execution did not finish in time")
        .unwrap()
}

async fn wait_for_node(engine: &WorkflowEngine, id: ExecutionId, node: &str) {
    for _ in 0..300 {
        let current = engine.get_execution(id).await.and_then(|e| e.current_node);
        if current.as_deref() == Some(node) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution never reached node {}", node);
}

#[tokio::test]
async fn test_linear_workflow_completes() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear("linear", vec![log("a")]))
        .await
        .unwrap();

    let execution = run(&engine, "linear", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(path(&execution), vec!["start", "a", "end"]);
    assert_eq!(execution.metrics.successful_nodes, 3);
    assert_eq!(execution.metrics.total_nodes, 3);
    assert_eq!(
        execution.context.get("a_output"),
        Some(&Value::from("at a"))
    );
    assert!(execution.ended_at.is_some());
    assert!(execution
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn test_retries_exhausted_under_stop_fails() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        ActionExecutor::with_builtins().with_handler(flaky("always.fail", calls.clone(), usize::MAX)),
        RuntimeConfig::default(),
    );

    let mut wf = WorkflowDefinition::new("retry-stop", "Retry stop").with_settings(fast_settings());
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(
        WorkflowNode::action("a", "always.fail")
            .with_retries(2)
            .with_error_handling(ErrorHandling::Stop),
    );
    wf.connect("start", "a");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "retry-stop", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let step = execution.steps_for("a").next().unwrap();
    assert_eq!(step.retry_count, 2);
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(execution.metrics.retries, 2);
    assert!(!execution.errors.is_empty());
    assert_eq!(execution.errors[0].category, ErrorCategory::Execution);
}

#[tokio::test]
async fn test_retries_exhausted_under_continue_completes() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        ActionExecutor::with_builtins().with_handler(flaky("always.fail", calls.clone(), usize::MAX)),
        RuntimeConfig::default(),
    );
    engine
        .register_workflow(linear(
            "retry-continue",
            vec![
                WorkflowNode::action("a", "always.fail")
                    .with_retries(2)
                    .with_error_handling(ErrorHandling::Continue),
                log("b"),
            ],
        ))
        .await
        .unwrap();

    let execution = run(&engine, "retry-continue", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(path(&execution), vec!["start", "a", "b", "end"]);
    assert_eq!(execution.steps_for("a").next().unwrap().retry_count, 2);
    assert_eq!(execution.errors.len(), 1);
    assert_eq!(execution.metrics.failed_nodes, 1);
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        ActionExecutor::with_builtins().with_handler(flaky("flaky", calls.clone(), 1)),
        RuntimeConfig::default(),
    );
    engine
        .register_workflow(linear("flaky", vec![WorkflowNode::action("a", "flaky")]))
        .await
        .unwrap();

    let mut events = engine.subscribe_events();
    let execution = run(&engine, "flaky", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps_for("a").next().unwrap().retry_count, 1);
    assert!(execution.errors.is_empty());

    let mut saw_retry = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::NodeRetrying { node_id, attempt, .. } = event {
            assert_eq!(node_id, "a");
            assert_eq!(attempt, 1);
            saw_retry = true;
        }
    }
    assert!(saw_retry);
}

#[tokio::test]
async fn test_fallback_node_runs_after_failure() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        ActionExecutor::with_builtins().with_handler(flaky("always.fail", calls, usize::MAX)),
        RuntimeConfig::default(),
    );

    let mut wf = linear(
        "fallback",
        vec![WorkflowNode::action("a", "always.fail")
            .with_retries(0)
            .with_fallback("recover")],
    );
    wf.add_node(log("recover"));
    wf.connect("recover", "end");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "fallback", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(path(&execution), vec!["start", "a", "recover", "end"]);
    assert_eq!(execution.errors.len(), 1);
}

#[tokio::test]
async fn test_retry_mode_falls_through_to_fallback() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        ActionExecutor::with_builtins().with_handler(flaky("always.fail", calls.clone(), usize::MAX)),
        RuntimeConfig::default(),
    );

    let mut wf = linear(
        "retry-fallback",
        vec![WorkflowNode::action("a", "always.fail")
            .with_retries(1)
            .with_error_handling(ErrorHandling::Retry)
            .with_fallback("recover")],
    );
    wf.add_node(log("recover"));
    wf.connect("recover", "end");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "retry-fallback", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(path(&execution), vec!["start", "a", "recover", "end"]);
    assert_eq!(execution.steps_for("a").next().unwrap().retry_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // without a fallback, exhausted retries stop the execution
    engine
        .register_workflow(linear(
            "retry-stop-mode",
            vec![
                WorkflowNode::action("a", "always.fail")
                    .with_retries(1)
                    .with_error_handling(ErrorHandling::Retry),
                log("b"),
            ],
        ))
        .await
        .unwrap();

    let execution = run(&engine, "retry-stop-mode", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(path(&execution), vec!["start", "a"]);
    assert_eq!(execution.steps_for("a").next().unwrap().retry_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_continue_prefers_error_edges() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        ActionExecutor::with_builtins().with_handler(flaky("always.fail", calls, usize::MAX)),
        RuntimeConfig::default(),
    );

    let mut wf = linear(
        "error-edges",
        vec![
            WorkflowNode::action("a", "always.fail")
                .with_retries(0)
                .with_error_handling(ErrorHandling::Continue),
            log("next"),
        ],
    );
    wf.add_node(log("handler"));
    wf.edges
        .push(WorkflowEdge::new("a", "handler").with_type(EdgeType::Error));
    wf.connect("handler", "end");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "error-edges", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(path(&execution), vec!["start", "a", "handler", "end"]);
}

#[tokio::test]
async fn test_decision_takes_only_matching_branch() {
    init_tracing();
    let engine = engine();

    let mut wf = WorkflowDefinition::new("decide", "Decide");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::decision(
        "check",
        Condition::greater_than("x", 10.0),
        vec!["high".into()],
        vec!["low".into()],
    ));
    wf.add_node(log("high"));
    wf.add_node(log("low"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect("start", "check");
    wf.connect("high", "end");
    wf.connect("low", "end");
    engine.register_workflow(wf).await.unwrap();

    let mut input = Variables::new();
    input.insert("x".into(), Value::from(15i64));
    let execution = run(&engine, "decide", input).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(path(&execution), vec!["start", "check", "high", "end"]);
    assert_eq!(execution.steps_for("low").count(), 0);
}

#[tokio::test]
async fn test_conditional_edges_route_by_context() {
    init_tracing();
    let engine = engine();

    let mut wf = WorkflowDefinition::new("edges", "Edges")
        .with_variable("tier", "gold");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(log("gold"));
    wf.add_node(log("basic"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect_when("start", "gold", Condition::equals("tier", "gold"));
    wf.connect_when("start", "basic", Condition::equals("tier", "basic"));
    wf.connect("gold", "end");
    wf.connect("basic", "end");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "edges", Variables::new()).await;
    assert_eq!(path(&execution), vec!["start", "gold", "end"]);

    let mut input = Variables::new();
    input.insert("tier".into(), Value::from("basic"));
    let execution = run(&engine, "edges", input).await;
    assert_eq!(path(&execution), vec!["start", "basic", "end"]);
}

#[tokio::test]
async fn test_condition_guard_ends_path() {
    init_tracing();
    let engine = engine();

    let guard = WorkflowNode::new(
        "guard",
        NodeConfig::Condition {
            conditions: vec![Condition::equals("enabled", true)],
            match_mode: Default::default(),
        },
    );
    engine
        .register_workflow(linear("guarded", vec![guard, log("work")]))
        .await
        .unwrap();

    let execution = run(&engine, "guarded", Variables::new()).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(path(&execution), vec!["start", "guard"]);

    let mut input = Variables::new();
    input.insert("enabled".into(), Value::Bool(true));
    let execution = run(&engine, "guarded", input).await;
    assert_eq!(path(&execution), vec!["start", "guard", "work", "end"]);
}

#[tokio::test]
async fn test_loop_runs_body_max_iterations() {
    init_tracing();
    let engine = engine();

    let mut wf = WorkflowDefinition::new("loop", "Loop");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::new(
        "repeat",
        NodeConfig::Loop {
            counter: "i".into(),
            max_iterations: 3,
            body: vec!["work".into()],
            exit: vec!["end".into()],
        },
    ));
    wf.add_node(log("work"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect("start", "repeat");
    wf.connect("work", "repeat");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "loop", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps_for("work").count(), 3);
    assert_eq!(execution.steps_for("repeat").count(), 4);
    assert_eq!(execution.steps_for("end").count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_long_loop_completes() {
    init_tracing();
    let engine = engine_with(
        ActionExecutor::with_builtins(),
        RuntimeConfig {
            max_node_visits: 20_000,
            ..RuntimeConfig::default()
        },
    );

    let mut wf = WorkflowDefinition::new("long-loop", "Long loop");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::new(
        "repeat",
        NodeConfig::Loop {
            counter: "i".into(),
            max_iterations: 5_000,
            body: vec!["work".into()],
            exit: vec!["end".into()],
        },
    ));
    wf.add_node(log("work"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect("start", "repeat");
    wf.connect("work", "repeat");
    engine.register_workflow(wf).await.unwrap();

    let id = engine
        .execute_workflow("long-loop", Variables::new(), "test")
        .await
        .unwrap();
    let execution = tokio::time::timeout(Duration::from_secs(60), engine.wait_for_execution(id))
        .await
        .expect("long loop did not finish in time")
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps_for("work").count(), 5_000);
    assert_eq!(execution.steps_for("end").count(), 1);
}

#[tokio::test]
async fn test_visit_limit_stops_endless_cycles() {
    init_tracing();
    let engine = engine_with(
        ActionExecutor::with_builtins(),
        RuntimeConfig {
            max_node_visits: 20,
            ..RuntimeConfig::default()
        },
    );

    let mut wf = WorkflowDefinition::new("cycle", "Cycle");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(log("a"));
    wf.add_node(log("b"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect("start", "a");
    wf.connect("a", "b");
    wf.connect("b", "a");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "cycle", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.steps.len(), 20);
    let error = execution.last_error().unwrap();
    assert_eq!(error.category, ErrorCategory::System);
    assert_eq!(error.code, "visit_limit_exceeded");
}

#[tokio::test]
async fn test_parallel_branches_join_at_merge() {
    init_tracing();
    let engine = engine();

    let mut wf = WorkflowDefinition::new("fan", "Fan out");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::parallel("fork"));
    for branch in ["b1", "b2", "b3"] {
        wf.add_node(set_var(branch, branch));
        wf.connect("fork", branch);
        wf.connect(branch, "join");
    }
    wf.add_node(WorkflowNode::merge("join"));
    wf.add_node(log("after"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect("start", "fork");
    wf.connect("join", "after");
    wf.connect("after", "end");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "fan", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    for branch in ["b1", "b2", "b3"] {
        assert_eq!(execution.steps_for(branch).count(), 1);
        assert_eq!(execution.context.get(branch), Some(&Value::Bool(true)));
    }
    assert_eq!(execution.steps_for("join").count(), 1);
    assert_eq!(execution.steps_for("after").count(), 1);

    let position = |node: &str| execution.steps.iter().position(|s| s.node_id == node).unwrap();
    let join = position("join");
    assert!(["b1", "b2", "b3"].iter().all(|b| position(b) < join));
    assert!(join < position("after"));
}

#[tokio::test]
async fn test_parallel_branches_do_not_see_sibling_writes() {
    init_tracing();
    // reports whether `x` is visible to the node running it
    let peek = FnAction::new("peek", |_params: Variables, ctx: NodeContext| async move {
        Ok::<_, NodeError>(NodeOutput::new().with_output(Value::Bool(ctx.variables.contains_key("x"))))
    });
    let engine = engine_with(ActionExecutor::with_builtins().with_handler(peek), RuntimeConfig::default());

    let mut wf = WorkflowDefinition::new("isolated", "Isolated branches");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::parallel("fork"));
    wf.add_node(set_var("writer", "x"));
    wf.add_node(WorkflowNode::delay("settle", 50));
    wf.add_node(WorkflowNode::action("reader", "peek"));
    wf.add_node(WorkflowNode::merge("join"));
    wf.add_node(WorkflowNode::action("after", "peek"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect("start", "fork");
    wf.connect("fork", "writer");
    wf.connect("fork", "settle");
    wf.connect("writer", "join");
    wf.connect("settle", "reader");
    wf.connect("reader", "join");
    wf.connect("join", "after");
    wf.connect("after", "end");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "isolated", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let position = |node: &str| execution.steps.iter().position(|s| s.node_id == node).unwrap();
    assert!(position("writer") < position("reader"));
    assert_eq!(execution.context.get("reader_output"), Some(&Value::Bool(false)));
    assert_eq!(execution.context.get("after_output"), Some(&Value::Bool(true)));
    assert_eq!(execution.context.get("x"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_failed_branch_blocks_join() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        ActionExecutor::with_builtins().with_handler(flaky("always.fail", calls, usize::MAX)),
        RuntimeConfig::default(),
    );

    let mut wf = WorkflowDefinition::new("fan-fail", "Fan out").with_settings(WorkflowSettings {
        max_retries: 0,
        ..fast_settings()
    });
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::parallel("fork"));
    wf.add_node(set_var("ok1", "ok1"));
    wf.add_node(WorkflowNode::action("bad", "always.fail"));
    wf.add_node(set_var("ok2", "ok2"));
    for branch in ["ok1", "bad", "ok2"] {
        wf.connect("fork", branch);
        wf.connect(branch, "join");
    }
    wf.add_node(WorkflowNode::merge("join"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect("start", "fork");
    wf.connect("join", "end");
    engine.register_workflow(wf).await.unwrap();

    let execution = run(&engine, "fan-fail", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.steps_for("ok1").count(), 1);
    assert_eq!(execution.steps_for("ok2").count(), 1);
    assert_eq!(execution.steps_for("join").count(), 0);
}

/// Custom node kind whose executor always panics
struct Exploding;

#[async_trait]
impl NodeExecutor for Exploding {
    fn kind(&self) -> &str {
        "exploding"
    }

    async fn execute(&self, node: &WorkflowNode, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        panic!("node {} blew up", node.id);
    }
}

#[tokio::test]
async fn test_panicking_executor_fails_execution() {
    init_tracing();
    let engine = engine_with(
        ActionExecutor::with_builtins(),
        RuntimeConfig {
            max_concurrent_executions: 1,
            ..RuntimeConfig::default()
        },
    );
    engine.register_node_executor(Arc::new(Exploding)).await;

    let explode = WorkflowNode::new(
        "explode",
        NodeConfig::Custom {
            name: "exploding".into(),
            settings: Variables::new(),
        },
    )
    .with_retries(3);
    engine
        .register_workflow(linear("explosive", vec![explode]))
        .await
        .unwrap();

    let mut events = engine.subscribe_events();
    let execution = run(&engine, "explosive", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.last_error().unwrap();
    assert_eq!(error.category, ErrorCategory::System);
    assert_eq!(error.code, "executor_panicked");
    assert!(error.message.contains("node explode blew up"));
    let step = execution.steps_for("explode").next().unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.retry_count, 0);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::ExecutionFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);

    // the slot came back, so the next run is accepted
    let execution = run(&engine, "explosive", Variables::new()).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_node_timeout_is_categorized() {
    init_tracing();
    let slow = FnAction::new("slow", |_params: Variables, _ctx: NodeContext| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(NodeOutput::new())
    });
    let engine = engine_with(
        ActionExecutor::with_builtins().with_handler(slow),
        RuntimeConfig::default(),
    );
    engine
        .register_workflow(linear(
            "slow",
            vec![WorkflowNode::action("a", "slow").with_timeout(50).with_retries(0)],
        ))
        .await
        .unwrap();

    let execution = run(&engine, "slow", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.last_error().unwrap();
    assert_eq!(error.category, ErrorCategory::Timeout);
    assert!(error.retryable);
    assert_eq!(error.details.get("timeout_ms"), Some(&Value::from(50u64)));
}

#[tokio::test]
async fn test_unknown_action_fails_without_retry() {
    init_tracing();
    let engine = engine();
    let result = engine
        .register_workflow(linear("unknown", vec![WorkflowNode::action("a", "no.such.action")]))
        .await
        .unwrap();
    assert!(result.warnings.iter().any(|w| w.contains("no.such.action")));

    let execution = run(&engine, "unknown", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.steps_for("a").next().unwrap().retry_count, 0);
    assert_eq!(execution.last_error().unwrap().category, ErrorCategory::Validation);
}

#[tokio::test]
async fn test_templates_read_context() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear(
            "template",
            vec![WorkflowNode::action("greet", "debug.log").with_param("message", "hello {{user.name}}")],
        ))
        .await
        .unwrap();

    let mut user = HashMap::new();
    user.insert("name".to_string(), Value::from("ada"));
    let mut input = Variables::new();
    input.insert("user".into(), Value::Object(user));
    let execution = run(&engine, "template", input).await;

    assert_eq!(execution.context.get("greet_output"), Some(&Value::from("hello ada")));
}

#[tokio::test]
async fn test_invalid_definition_is_not_registered() {
    init_tracing();
    let engine = engine();
    let wf = linear("broken", vec![log("a")]).with_edge(WorkflowEdge::new("a", "ghost"));

    let err = engine.register_workflow(wf).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidWorkflow { .. }));
    assert!(engine.get_workflow("broken").await.is_none());

    let mut no_start = linear("no-start", vec![log("a")]);
    no_start.nodes.retain(|n| n.id != "start");
    no_start.edges.retain(|e| e.source != "start");
    assert!(!engine.validate_workflow(&no_start).await.valid);
}

#[tokio::test]
async fn test_reregistering_replaces_definition() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear("wf", vec![log("a")]))
        .await
        .unwrap();

    let mut v2 = linear("wf", vec![log("a"), log("b")]);
    v2.version = "2.0.0".into();
    engine.register_workflow(v2).await.unwrap();

    let workflows = engine.list_workflows().await;
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].version, "2.0.0");

    let execution = run(&engine, "wf", Variables::new()).await;
    assert_eq!(execution.workflow_version, "2.0.0");
    assert_eq!(path(&execution), vec!["start", "a", "b", "end"]);
}

#[tokio::test]
async fn test_concurrency_ceiling_rejects_extra_executions() {
    init_tracing();
    let engine = engine_with(
        ActionExecutor::with_builtins(),
        RuntimeConfig {
            max_concurrent_executions: 2,
            ..RuntimeConfig::default()
        },
    );
    engine
        .register_workflow(linear("slow", vec![WorkflowNode::delay("wait", 5_000)]))
        .await
        .unwrap();

    let first = engine
        .execute_workflow("slow", Variables::new(), "test")
        .await
        .unwrap();
    let second = engine
        .execute_workflow("slow", Variables::new(), "test")
        .await
        .unwrap();

    let err = engine
        .execute_workflow("slow", Variables::new(), "test")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { limit: 2 }));
    assert_eq!(engine.get_running_executions().await.len(), 2);
    assert_eq!(engine.get_executions_by_workflow("slow").await.len(), 2);

    // cancelling frees a slot right away
    engine.cancel_execution(first).await.unwrap();
    let third = engine
        .execute_workflow("slow", Variables::new(), "test")
        .await
        .unwrap();

    engine.cancel_execution(second).await.unwrap();
    engine.cancel_execution(third).await.unwrap();
}

#[tokio::test]
async fn test_cancel_stops_execution() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear("cancel", vec![WorkflowNode::delay("wait", 5_000), log("after")]))
        .await
        .unwrap();

    let id = engine
        .execute_workflow("cancel", Variables::new(), "test")
        .await
        .unwrap();
    wait_for_node(&engine, id, "wait").await;

    engine.cancel_execution(id).await.unwrap();
    let execution = engine.wait_for_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let execution = engine.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.steps_for("after").count(), 0);
    assert_eq!(
        execution.steps_for("wait").next().unwrap().status,
        StepStatus::Skipped
    );

    // a finished execution cannot be cancelled again
    let err = engine.cancel_execution(id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_pause_and_resume() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear(
            "pausable",
            vec![WorkflowNode::delay("wait", 150), log("after")],
        ))
        .await
        .unwrap();

    let id = engine
        .execute_workflow("pausable", Variables::new(), "test")
        .await
        .unwrap();
    wait_for_node(&engine, id, "wait").await;

    engine.pause_execution(id).await.unwrap();
    assert!(engine.pause_execution(id).await.is_err());

    // the delay finishes, but the walk holds before the next node
    tokio::time::sleep(Duration::from_millis(400)).await;
    let paused = engine.get_execution(id).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(paused.current_node.as_deref(), Some("wait"));
    assert_eq!(paused.steps_for("after").count(), 0);
    assert_eq!(engine.get_running_executions().await.len(), 1);

    engine.resume_execution(id).await.unwrap();
    let execution = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_execution(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(path(&execution), vec!["start", "wait", "after", "end"]);
}

#[tokio::test]
async fn test_pause_during_last_node_holds_completion() {
    init_tracing();
    let engine = engine();

    let mut wf = WorkflowDefinition::new("tail", "Tail pause");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::delay("wait", 150));
    wf.connect("start", "wait");
    engine.register_workflow(wf).await.unwrap();

    let id = engine
        .execute_workflow("tail", Variables::new(), "test")
        .await
        .unwrap();
    wait_for_node(&engine, id, "wait").await;
    engine.pause_execution(id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let paused = engine.get_execution(id).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(
        paused.steps_for("wait").next().unwrap().status,
        StepStatus::Completed
    );

    engine.resume_execution(id).await.unwrap();
    let execution = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_execution(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.ended_at.is_some());
}

#[tokio::test]
async fn test_unregister_cascades() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear("doomed", vec![WorkflowNode::delay("wait", 5_000)]))
        .await
        .unwrap();
    engine
        .add_trigger(WorkflowTrigger::event("on-order", "doomed", "orders"))
        .await
        .unwrap();

    let id = engine
        .execute_workflow("doomed", Variables::new(), "test")
        .await
        .unwrap();
    wait_for_node(&engine, id, "wait").await;

    engine.unregister_workflow("doomed").await.unwrap();

    let execution = engine.wait_for_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert!(engine.get_workflow("doomed").await.is_none());
    assert!(engine.list_triggers().await.is_empty());
    assert!(matches!(
        engine.unregister_workflow("doomed").await,
        Err(EngineError::WorkflowNotFound(_))
    ));
}

#[tokio::test]
async fn test_workflow_metrics() {
    init_tracing();
    let fail_when_asked = FnAction::new("maybe.fail", |params: Variables, _ctx: NodeContext| async move {
        if params.get("fail") == Some(&Value::Bool(true)) {
            Err(NodeError::ExecutionFailed("asked to fail".into()))
        } else {
            Ok(NodeOutput::new())
        }
    });
    let engine = engine_with(
        ActionExecutor::with_builtins().with_handler(fail_when_asked),
        RuntimeConfig::default(),
    );
    engine
        .register_workflow(linear(
            "metered",
            vec![WorkflowNode::action("a", "maybe.fail")
                .with_param("fail", "{{fail}}")
                .with_retries(0)],
        ))
        .await
        .unwrap();

    run(&engine, "metered", Variables::new()).await;
    run(&engine, "metered", Variables::new()).await;
    let mut input = Variables::new();
    input.insert("fail".into(), Value::Bool(true));
    let failed = run(&engine, "metered", input).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);

    let metrics = engine.get_workflow_metrics("metered").await;
    assert_eq!(metrics.total_executions, 3);
    assert_eq!(metrics.successful_executions, 2);
    assert_eq!(metrics.failed_executions, 1);
    assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!(metrics.last_execution_at.is_some());
}

#[tokio::test]
async fn test_history_is_bounded() {
    init_tracing();
    let engine = engine_with(
        ActionExecutor::with_builtins(),
        RuntimeConfig {
            max_execution_history: 2,
            ..RuntimeConfig::default()
        },
    );
    engine
        .register_workflow(linear("short", vec![log("a")]))
        .await
        .unwrap();

    let first = run(&engine, "short", Variables::new()).await;
    for _ in 0..3 {
        run(&engine, "short", Variables::new()).await;
    }
    // pruning runs right after each execution finishes
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.get_executions_by_workflow("short").await.len(), 2);
    assert!(engine.get_execution(first.id).await.is_none());
}

#[tokio::test]
async fn test_event_trigger_starts_execution() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear("on-order", vec![log("a")]))
        .await
        .unwrap();
    engine
        .add_trigger(WorkflowTrigger::event("t1", "on-order", "orders").with_filter("region", "eu"))
        .await
        .unwrap();

    let mut events = engine.subscribe_events();
    let mut us = Variables::new();
    us.insert("region".into(), Value::from("us"));
    engine.publish_event("orders", us);
    let mut eu = Variables::new();
    eu.insert("region".into(), Value::from("eu"));
    eu.insert("order_id".into(), Value::from(42i64));
    assert_eq!(engine.publish_event("orders", eu), 1);

    let execution_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::TriggerFired { execution_id, trigger_id, .. }) = events.recv().await {
                assert_eq!(trigger_id, "t1");
                return execution_id;
            }
        }
    })
    .await
    .expect("trigger never fired");

    let execution = engine.wait_for_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.triggered_by, "trigger:t1");
    assert_eq!(execution.context.get("order_id"), Some(&Value::from(42i64)));
    assert_eq!(engine.get_executions_by_workflow("on-order").await.len(), 1);
}

#[tokio::test]
async fn test_condition_trigger_reads_facts() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear("alarm", vec![log("a")]))
        .await
        .unwrap();
    engine
        .add_trigger(WorkflowTrigger::condition(
            "hot",
            "alarm",
            vec![Condition::greater_than("temperature", 30.0)],
            10,
            2,
        ))
        .await
        .unwrap();

    let mut events = engine.subscribe_events();
    engine.facts().set("temperature", 35i64).await;

    let execution_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::TriggerFired { execution_id, .. }) = events.recv().await {
                return execution_id;
            }
        }
    })
    .await
    .expect("condition trigger never fired");

    engine.set_trigger_enabled("hot", false).await.unwrap();
    let execution = engine.wait_for_execution(execution_id).await.unwrap();
    assert_eq!(execution.triggered_by, "trigger:hot");
    assert_eq!(execution.context.get("temperature"), Some(&Value::from(35i64)));
    assert!(!engine.get_trigger("hot").await.unwrap().enabled);
}

#[tokio::test]
async fn test_json_actions_round_through_context() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear(
            "json",
            vec![
                WorkflowNode::action("parse", "json.parse")
                    .with_param("json", "{{raw}}")
                    .with_param("into", "order"),
                WorkflowNode::action("dump", "json.stringify").with_param("value", "{{order.items}}"),
            ],
        ))
        .await
        .unwrap();

    let mut input = Variables::new();
    input.insert("raw".into(), Value::from(r#"{"id": 7, "items": ["a", "b"]}"#));
    let execution = run(&engine, "json", input).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let order = execution.context.get("order").unwrap();
    assert_eq!(order.get_path("id"), Some(&Value::Number(7.0)));
    assert_eq!(
        execution.context.get("dump_output"),
        Some(&Value::from(r#"["a","b"]"#))
    );
}

#[tokio::test]
async fn test_http_request_without_url_is_a_user_error() {
    init_tracing();
    let engine = engine();
    engine
        .register_workflow(linear(
            "http",
            vec![WorkflowNode::action("fetch", "http.request").with_param("url", "{{missing}}")],
        ))
        .await
        .unwrap();

    let execution = run(&engine, "http", Variables::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.last_error().unwrap();
    assert_eq!(error.category, ErrorCategory::User);
    assert!(!error.retryable);
    assert_eq!(execution.steps_for("fetch").next().unwrap().retry_count, 0);
}
