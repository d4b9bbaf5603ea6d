use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use primcore::{ExecutionEvent, NodeEvent, NodeRunState, NodeSpec, RunStatus, Value, WorkflowGraph};
use primruntime::{Engine, EngineConfig, MemoryRecordStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "prim")]
#[command(about = "Primitive workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow graph file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger data as a JSON string
        #[arg(short, long)]
        trigger: Option<String>,

        /// Engine configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow graph file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available primitive types
    Primitives,

    /// Create an example branching workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            trigger,
            config,
            verbose,
        } => {
            init_tracing(verbose);
            let status = run_workflow(&file, trigger.as_deref(), config.as_deref()).await?;
            if status != RunStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Validate { file } => {
            init_tracing(false);
            if !validate_workflow(&file)? {
                std::process::exit(1);
            }
        }
        Commands::Primitives => list_primitives(),
        Commands::Init { output } => create_example_workflow(&output)?,
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_graph(file: &Path) -> Result<WorkflowGraph> {
    WorkflowGraph::from_file(file).with_context(|| format!("loading workflow {}", file.display()))
}

fn load_config(file: Option<&Path>) -> Result<EngineConfig> {
    let Some(file) = file else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing engine config {}", file.display()))
}

async fn run_workflow(
    file: &Path,
    trigger: Option<&str>,
    config: Option<&Path>,
) -> Result<RunStatus> {
    let graph = load_graph(file)?;
    let config = load_config(config)?;
    let trigger_data: Value = match trigger {
        Some(raw) => serde_json::from_str(raw).context("trigger data must be valid JSON")?,
        None => Value::Object(Default::default()),
    };

    println!("Workflow: {} ({} nodes, {} edges)", graph.name, graph.nodes.len(), graph.edges.len());

    let engine = Engine::new(
        Arc::new(primnodes::default_registry()),
        Arc::new(MemoryRecordStore::new()),
        config,
    );

    let mut events = engine.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::NodeStateChanged { node_id, to, attempt, .. } => match to {
                    NodeRunState::Running => println!("  > {} (attempt {})", node_id, attempt),
                    NodeRunState::Succeeded => println!("  + {} succeeded", node_id),
                    NodeRunState::Failed => println!("  x {} failed", node_id),
                    NodeRunState::Skipped => println!("  - {} skipped", node_id),
                    _ => {}
                },
                ExecutionEvent::NodeRetryScheduled { node_id, attempt, delay_ms, error, .. } => {
                    println!(
                        "  ! {} attempt {} failed ({}), retrying in {}ms",
                        node_id, attempt, error, delay_ms
                    );
                }
                ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => println!("    [{}] {}", node_id, message),
                    NodeEvent::Warning { message } => {
                        println!("    [{}] warning: {}", node_id, message)
                    }
                    NodeEvent::Progress { percent, message } => {
                        println!("    [{}] {}% {}", node_id, percent, message.unwrap_or_default())
                    }
                },
                ExecutionEvent::RunFinished { status, duration_ms, .. } => {
                    println!("Run {} after {}ms", status, duration_ms);
                    break;
                }
                ExecutionEvent::RunStarted { run_id, .. } => println!("Run {} started", run_id),
            }
        }
    });

    let mut handle = engine.start_run(graph, Uuid::new_v4(), trigger_data).await?;
    let snapshot = handle.wait().await;
    let _ = printer.await;

    let report = serde_json::json!({
        "status": snapshot,
        "context": handle.outputs().unwrap_or_default(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(snapshot.status)
}

fn validate_workflow(file: &Path) -> Result<bool> {
    let graph = load_graph(file)?;
    let engine = Engine::with_registry(primnodes::default_registry());

    match engine.validate(&graph) {
        Ok(order) => {
            println!("Workflow '{}' is valid", graph.name);
            println!("Execution order: {}", order.join(" -> "));
            Ok(true)
        }
        Err(primcore::WorkflowError::Validation(err)) => {
            println!("Workflow '{}' is invalid:", graph.name);
            for issue in &err.issues {
                println!("  - {}", issue);
            }
            Ok(false)
        }
        Err(err) => {
            println!("Workflow '{}' is invalid: {}", graph.name, err);
            Ok(false)
        }
    }
}

fn list_primitives() {
    let registry = primnodes::default_registry();
    println!("Available primitive types:");
    for primitive_type in registry.list_types() {
        if let Some(info) = registry.describe(&primitive_type) {
            println!("  {} - {}", info.primitive_type, info.description);
            println!("    subtypes: {}", info.subtypes.join(", "));
        }
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    let mut graph = WorkflowGraph::new("Order triage");
    graph.description =
        Some("Routes large orders to review and the rest to fulfilment".to_string());

    let trigger = graph.add_node(
        NodeSpec::new("receive", "trigger", "manual").with_name("Receive order"),
    );
    let check = graph.add_node(
        NodeSpec::new("is_large", "condition", "if_else")
            .with_name("Large order?")
            .with_config("path", "trigger_data")
            .with_config("condition", "amount >= 1000"),
    );
    let review = graph.add_node(
        NodeSpec::new("review", "action", "transform")
            .with_name("Flag for review")
            .with_config("transform_type", "review"),
    );
    let fulfil = graph.add_node(
        NodeSpec::new("fulfil", "data", "enrich")
            .with_name("Mark for fulfilment")
            .with_config("path", "evaluated_data")
            .with_config("enrichment_data", serde_json::json!({"queue": "fulfilment"})),
    );

    graph.connect(trigger, check.clone());
    graph.connect_branch(check.clone(), review, "true");
    graph.connect_branch(check, fulfil, "false");

    std::fs::write(output, serde_json::to_string_pretty(&graph)?)?;

    println!("Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  prim run --file {} --trigger '{{\"amount\": 250}}'", output.display());
    Ok(())
}
