use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use stepcore::{
    Condition, EngineEvent, ExecutionStatus, NodeEvent, Value, Variables, WorkflowDefinition,
    WorkflowNode,
};
use stepnodes::ActionExecutor;
use stepruntime::{RuntimeConfig, WorkflowEngine};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "step")]
#[command(about = "Stepwise workflow engine CLI", long_about = None)]
struct Cli {
    /// Runtime configuration as a JSON file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `max_concurrent_executions` from the config file
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    /// Overrides `default_node_timeout_ms` from the config file
    #[arg(long, global = true)]
    node_timeout_ms: Option<u64>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file and wait for it to finish
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input variables as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Print the full execution record as JSON when done
        #[arg(long)]
        json: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node kinds and actions
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => RuntimeConfig::default(),
    };
    if let Some(max) = cli.max_concurrent {
        config.max_concurrent_executions = max;
    }
    if let Some(timeout) = cli.node_timeout_ms {
        config.default_node_timeout_ms = timeout;
    }
    Ok(config)
}

fn load_workflow(file: &Path) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading workflow {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing workflow {}", file.display()))
}

fn parse_input(input: Option<&str>) -> Result<Variables> {
    let Some(input) = input else {
        return Ok(Variables::new());
    };
    match serde_json::from_str::<serde_json::Value>(input)? {
        serde_json::Value::Object(obj) => Ok(obj
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect()),
        _ => bail!("Input must be a JSON object"),
    }
}

fn engine(config: RuntimeConfig) -> WorkflowEngine {
    WorkflowEngine::with_registry(stepnodes::standard_registry(), config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(&cli)?;
    tracing::debug!("Runtime config: {:?}", config);

    match &cli.command {
        Commands::Run { file, input, json } => {
            run_workflow(config, file, input.as_deref(), *json).await?;
        }
        Commands::Validate { file } => {
            validate_workflow(config, file).await?;
        }
        Commands::Nodes => {
            list_nodes(config).await;
        }
        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

async fn run_workflow(config: RuntimeConfig, file: &Path, input: Option<&str>, json: bool) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(file)?;
    let inputs = parse_input(input)?;

    println!("📋 Workflow: {} ({})", workflow.name, workflow.version);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();

    let engine = engine(config);
    let report = engine.register_workflow(workflow.clone()).await?;
    for warning in &report.warnings {
        println!("⚠️  {}", warning);
    }

    // Subscribe before starting so no event is missed
    let mut events = engine.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::ExecutionStarted { .. } => {
                    println!("▶️  Workflow started");
                }
                EngineEvent::NodeStarted { node_id, node_kind, .. } => {
                    println!("  ⚡ Starting node: {} ({})", node_id, node_kind);
                }
                EngineEvent::NodeCompleted { node_id, duration_ms, .. } => {
                    println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
                }
                EngineEvent::NodeRetrying { node_id, attempt, delay_ms, .. } => {
                    println!("  🔁 Node {} retry {} in {}ms", node_id, attempt, delay_ms);
                }
                EngineEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ❌ Node {} failed: {}", node_id, error);
                }
                EngineEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Progress { percent, message } => match message {
                        Some(msg) => println!("     📊 [{}] {}% - {}", node_id, percent, msg),
                        None => println!("     📊 [{}] {}%", node_id, percent),
                    },
                },
                EngineEvent::ExecutionCompleted { duration_ms, .. } => {
                    println!("✨ Workflow completed successfully in {}ms", duration_ms);
                }
                EngineEvent::ExecutionFailed { error, .. } => {
                    println!("💥 Workflow failed: {}", error);
                }
                _ => {}
            }
        }
    });

    let execution_id = engine.execute_workflow(&workflow.id, inputs, "cli").await?;
    let execution = engine.wait_for_execution(execution_id).await?;

    // Let the printer drain what is already queued
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();
    engine.shutdown().await;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.id);
    println!("   Status: {}", execution.status.as_str());
    println!(
        "   Nodes: {} succeeded, {} failed, {} retries",
        execution.metrics.successful_nodes, execution.metrics.failed_nodes, execution.metrics.retries
    );
    if let Some(duration) = execution.metrics.duration_ms {
        println!("   Duration: {}ms", duration);
    }
    for error in &execution.errors {
        println!("   Error: {}", error);
    }

    if json {
        println!();
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else if !execution.context.is_empty() {
        println!();
        println!("📤 Context:");
        let mut keys: Vec<&String> = execution.context.keys().collect();
        keys.sort();
        for key in keys {
            println!("   {}: {}", key, execution.context[key]);
        }
    }

    if execution.status != ExecutionStatus::Completed {
        bail!("execution {} ended as {}", execution.id, execution.status.as_str());
    }
    Ok(())
}

async fn validate_workflow(config: RuntimeConfig, file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let workflow = load_workflow(file)?;
    let report = engine(config).validate_workflow(&workflow).await;

    for warning in &report.warnings {
        println!("⚠️  {}", warning);
    }
    if !report.valid {
        for error in &report.errors {
            println!("❌ {}", error);
        }
        bail!("workflow {} has {} error(s)", workflow.id, report.errors.len());
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    Ok(())
}

async fn list_nodes(config: RuntimeConfig) {
    println!("📦 Available Node Kinds:");
    println!();

    let engine = engine(config);
    for kind in engine.node_kinds().await {
        match engine.node_schema(&kind).await {
            Some(schema) => {
                println!("  • {} ({})", kind, schema.category);
                println!("    {}", schema.description);
            }
            None => println!("  • {}", kind),
        }
    }

    println!();
    println!("🔧 Actions:");
    for action in ActionExecutor::with_builtins().actions() {
        println!("  • {}", action);
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = WorkflowDefinition::new("example-http", "Example HTTP Workflow");
    workflow.description = Some("Fetches data from an API and logs the result".to_string());
    workflow = workflow.with_variable("url", "https://api.github.com/zen");

    workflow.add_node(WorkflowNode::start("start").with_position(0.0, 100.0));
    workflow.add_node(
        WorkflowNode::action("fetch", "http.request")
            .with_name("Fetch Data")
            .with_param("url", "{{url}}")
            .with_param("method", "GET")
            .with_retries(2)
            .with_position(150.0, 100.0),
    );
    workflow.add_node(WorkflowNode::decision(
        "ok",
        Condition::less_than("fetch_output.status", 400.0),
        vec!["log".into()],
        vec!["end".into()],
    ));
    workflow.add_node(
        WorkflowNode::action("log", "debug.log")
            .with_name("Log Response")
            .with_param("message", "{{fetch_output.body}}")
            .with_position(450.0, 100.0),
    );
    workflow.add_node(WorkflowNode::end("end").with_position(600.0, 100.0));

    workflow.connect("start", "fetch");
    workflow.connect("fetch", "ok");
    workflow.connect("log", "end");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  step run --file {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );
    Ok(())
}
