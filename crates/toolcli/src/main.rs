use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use toolcore::{
    EventPayload, ExecutionContext, ExecutionEvent, Graph, HistoryFilter, NodeSpec, RunStatus,
    Value,
};
use toolruntime::{FlowRuntime, ModuleRegistry, RuntimeConfig, ToolRegistry};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "toolflow")]
#[command(about = "Tool graph runner", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Runtime configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph file
    Run {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Run inputs as a JSON object
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Validate a graph file without running it
    Validate {
        /// Path to graph JSON file
        file: PathBuf,
    },

    /// Run a single tool
    Exec {
        /// Tool name
        tool: String,

        /// Tool inputs as a JSON object
        #[arg(short, long)]
        input: Option<String>,
    },

    /// List available tools
    Tools,

    /// Show finished runs, newest first
    History {
        #[arg(long)]
        tool: Option<String>,

        #[arg(long, value_parser = parse_status)]
        status: Option<RunStatus>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Create an example graph
    Init {
        /// Output file path
        #[arg(short, long, default_value = "graph.json")]
        output: PathBuf,
    },
}

fn parse_status(s: &str) -> Result<RunStatus, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown run status '{}'", s))
}

fn parse_inputs(input: Option<&str>) -> Result<HashMap<String, Value>> {
    let Some(input_str) = input else {
        return Ok(HashMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(input_str).context("Invalid --input JSON")?;
    match Value::from(json) {
        Value::Object(obj) => Ok(obj.into_iter().collect()),
        _ => bail!("Input must be a JSON object"),
    }
}

fn load_graph(file: &Path) -> Result<Graph> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", file.display()))
}

fn build_runtime(config_path: Option<&Path>) -> Result<FlowRuntime> {
    let config = RuntimeConfig::load(config_path)?;
    tracing::debug!(?config, "Runtime configuration");
    let mut tools = ToolRegistry::new();
    let mut modules = ModuleRegistry::new();
    toolmodules::register_all(&mut tools, &mut modules);
    Ok(FlowRuntime::from_config(config, tools, modules)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run { file, input } => {
            let graph = load_graph(&file)?;
            let inputs = parse_inputs(input.as_deref())?;
            println!("Loading graph from: {}", file.display());
            run_graph(&build_runtime(config)?, graph, inputs).await?;
        }

        Commands::Validate { file } => {
            validate_graph(&build_runtime(config)?, &file)?;
        }

        Commands::Exec { tool, input } => {
            let inputs = parse_inputs(input.as_deref())?;
            let mut graph = Graph::new(format!("exec {}", tool));
            graph.add_node(NodeSpec::new(tool.clone(), tool));
            run_graph(&build_runtime(config)?, graph, inputs).await?;
        }

        Commands::Tools => {
            list_tools(&build_runtime(config)?);
        }

        Commands::History { tool, status, limit } => {
            let filter = HistoryFilter {
                tool,
                status,
                ..HistoryFilter::default()
            };
            show_history(&build_runtime(config)?, &filter, limit).await?;
        }

        Commands::Init { output } => {
            create_example_graph(&output)?;
        }
    }

    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    let node = event.node_id.as_deref().unwrap_or("-");
    match &event.payload {
        EventPayload::RunStarted {
            node_count,
            layer_count,
            ..
        } => {
            println!("Run started: {} nodes in {} layers", node_count, layer_count);
        }
        EventPayload::NodeStarted { tool, attempt } if *attempt > 1 => {
            println!("  Retrying node: {} ({}), attempt {}", node, tool, attempt);
        }
        EventPayload::NodeStarted { tool, .. } => {
            println!("  Starting node: {} ({})", node, tool);
        }
        EventPayload::NodeOutput { stream, line } => {
            println!("     [{}:{}] {}", node, stream, line);
        }
        EventPayload::NodeStatusChanged { status, error } => match error {
            Some(error) => println!("  Node {} {}: {}", node, status, error),
            None => println!("  Node {} {}", node, status),
        },
        EventPayload::RunCompleted { status, duration_ms } => {
            println!("Run {} in {}ms", status, duration_ms);
        }
        EventPayload::RunFailed {
            errors, duration_ms, ..
        } => {
            println!("Run failed after {}ms", duration_ms);
            for (node_id, error) in errors {
                println!("  {}: {}", node_id, error);
            }
        }
    }
}

fn print_summary(ctx: &ExecutionContext) {
    println!();
    println!("Execution Summary:");
    println!("   Run ID: {}", ctx.run_id());
    println!("   Status: {}", ctx.status());
    for (node_id, record) in ctx.nodes() {
        println!("   Node {} [{}]", node_id, record.status);
        let mut keys: Vec<&String> = record.output.keys().collect();
        keys.sort();
        for key in keys {
            println!("     {}: {}", key, record.output[key].to_arg_string());
        }
    }
}

async fn run_graph(
    runtime: &FlowRuntime,
    graph: Graph,
    inputs: HashMap<String, Value>,
) -> Result<()> {
    let (run_id, mut events) = runtime.submit_and_subscribe(graph, inputs).await?;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if event.is_terminal() {
                    break;
                }
            }
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                eprintln!("Interrupted, cancelling run {}", run_id);
                runtime.cancel(run_id).await?;
            }
        }
    }

    let ctx = runtime.wait(run_id).await?;
    print_summary(&ctx);
    match ctx.status() {
        RunStatus::Completed => Ok(()),
        other => bail!("Run {} finished as {}", run_id, other),
    }
}

fn validate_graph(runtime: &FlowRuntime, file: &Path) -> Result<()> {
    println!("Validating graph: {}", file.display());
    let graph = load_graph(file)?;
    let layers = runtime.validate(&graph)?;

    println!("Graph is valid:");
    if let Some(name) = &graph.name {
        println!("   Name: {}", name);
    }
    println!("   Nodes: {}", graph.nodes.len());
    println!("   Edges: {}", graph.edges.len());
    for (idx, layer) in layers.iter().enumerate() {
        println!("   Layer {}: {}", idx, layer.join(", "));
    }
    Ok(())
}

fn list_tools(runtime: &FlowRuntime) {
    println!("Available Tools:");
    println!();
    for descriptor in runtime.descriptors() {
        println!("  • {} ({}, {:?})", descriptor.name, descriptor.category, descriptor.mode);
        if !descriptor.description.is_empty() {
            println!("    {}", descriptor.description);
        }
    }
}

async fn show_history(runtime: &FlowRuntime, filter: &HistoryFilter, limit: usize) -> Result<()> {
    let records = runtime.history(filter, limit).await?;
    if records.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  {:>9}  {:>6}ms  {}",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.run_id,
            record.status.to_string(),
            record.duration_ms,
            record.tools.join(",")
        );
    }
    Ok(())
}

fn create_example_graph(output: &Path) -> Result<()> {
    let mut graph = Graph::new("Example scan graph");

    graph.add_node(
        NodeSpec::new("scan", "fs.scan")
            .with_name("Scan directory")
            .with_config("recursive", true)
            .with_input("path", true),
    );
    graph.add_node(
        NodeSpec::new("encode", "transform.json_stringify")
            .with_name("Encode file list")
            .with_config("pretty", true)
            .with_input("value", true),
    );
    graph.add_node(NodeSpec::new("report", "debug.log").with_name("Log result"));

    graph.connect("scan", "files", "encode", "value");
    graph.connect("encode", "json", "report", "message");

    let json = serde_json::to_string_pretty(&graph)?;
    std::fs::write(output, json)?;

    println!("Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  toolflow run --file {} --input '{{\"scan.path\": \".\"}}'",
        output.display()
    );

    Ok(())
}
