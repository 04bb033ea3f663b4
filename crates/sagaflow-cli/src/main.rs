//! Demo CLI: run bundled workflows against the in-memory store.

mod demo;

use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use sagaflow_engine::graph::signature;
use sagaflow_engine::observe::TracingNotifier;
use sagaflow_engine::prelude::*;
use sagaflow_engine::testing;

#[derive(Parser)]
#[command(name = "sagaflow", about = "Durable workflow engine demo", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a workflow, drive it to quiescence, print the outcome
    Run {
        /// Workflow to run
        #[arg(long, default_value = "order_fulfillment")]
        workflow: String,

        /// Workflow input as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,

        /// Deliver this signal (name=JSON payload) once the run settles
        #[arg(long)]
        signal: Option<String>,

        /// Print the full event timeline
        #[arg(long)]
        events: bool,
    },

    /// List bundled workflows
    Workflows,

    /// Show a workflow's structure and determinism signature
    Graph {
        #[arg(long, default_value = "order_fulfillment")]
        workflow: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let engine = demo::build_engine(Arc::new(TracingNotifier))?;

    match cli.command {
        Commands::Run {
            workflow,
            input,
            signal,
            events,
        } => run(&engine, &workflow, &input, signal.as_deref(), events).await,
        Commands::Workflows => {
            for name in demo::workflow_names() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Graph { workflow } => show_graph(&engine, &workflow),
    }
}

async fn run(
    engine: &Engine<MemoryStore>,
    workflow: &str,
    input: &str,
    signal: Option<&str>,
    events: bool,
) -> anyhow::Result<()> {
    let input: serde_json::Value =
        serde_json::from_str(input).context("parsing --input as JSON")?;

    let record = engine.start(workflow, input).await?;
    println!("started execution {}", record.id);
    testing::drain(engine).await?;

    if let Some(signal) = signal {
        let (name, payload) = match signal.split_once('=') {
            Some((name, payload)) => (
                name,
                serde_json::from_str(payload).context("parsing signal payload as JSON")?,
            ),
            None => (signal, json!({})),
        };
        engine.signal(record.id, name, payload).await?;
        println!("delivered signal `{name}`");
        testing::drain(engine).await?;
    }

    let record = testing::refreshed(engine, record.id).await?;
    println!("state: {:?}", record.state);
    if let Some(error) = &record.last_error {
        println!("error: {}", error.message);
    }
    println!("context: {}", serde_json::Value::Object(record.ctx.clone()));

    if events {
        println!("timeline:");
        for event in engine.store().load_history(record.id).await? {
            println!("  {:>3}  {}", event.sequence, event.payload.event_type());
        }
    }
    Ok(())
}

fn show_graph(engine: &Engine<MemoryStore>, workflow: &str) -> anyhow::Result<()> {
    let Ok(graph) = engine.graphs().get(workflow) else {
        bail!("unknown workflow `{workflow}`");
    };
    println!("workflow: {}", graph.name());
    println!("signature: {}", signature::signature(&graph));
    println!("steps:");
    for step in graph.steps() {
        match step.task_name() {
            Some(task) => println!("  {} -> task `{task}`", step.name),
            None => println!("  {} (inline)", step.name),
        }
    }
    let signals: Vec<_> = graph.signal_names().collect();
    if !signals.is_empty() {
        println!("signals: {}", signals.join(", "));
    }
    let queries: Vec<_> = graph.query_names().collect();
    if !queries.is_empty() {
        println!("queries: {}", queries.join(", "));
    }
    for (step, task) in graph.compensations() {
        println!("compensation: {step} -> {task}");
    }
    Ok(())
}
