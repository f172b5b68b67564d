use anyhow::{Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use beacon_core::{parse_workflow, EngineError, RunStatus};
use beacon_engine::{EngineConfig, WorkflowExecutor};

#[derive(Parser)]
#[command(name = "beaconctl")]
#[command(version, about = "Beacon workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root scripts and file operations are confined to
    #[arg(long)]
    project_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition and report every issue found
    ///
    /// Examples:
    ///     beaconctl validate ./workflows/report.yaml
    #[command(verbatim_doc_comment)]
    Validate {
        /// Workflow definition file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Print the dependency waves a workflow would execute in
    Graph {
        /// Workflow definition file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Execute a workflow and print the run record as JSON
    ///
    /// Examples:
    ///     beaconctl run ./workflows/report.yaml --input region=eu
    ///     beaconctl run ./workflows/report.yaml --input limit=20 --quiet
    #[command(verbatim_doc_comment)]
    Run {
        /// Workflow definition file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Run inputs as key=value pairs; values parse as JSON when possible
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Suppress the live event stream
        #[arg(short, long)]
        quiet: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Graph { file } => graph(&file),
        Commands::Run { file, inputs, quiet } => run(&file, &inputs, quiet, cli.project_root).await,
    }
}

fn load(file: &PathBuf) -> Result<beacon_core::Workflow> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    match parse_workflow(&text) {
        Ok(workflow) => Ok(workflow),
        Err(EngineError::Validation(issues)) => {
            eprintln!("{} issue(s) in {}:", issues.len(), file.display());
            for issue in &issues {
                eprintln!("  - {issue}");
            }
            anyhow::bail!("workflow definition is invalid");
        }
        Err(e) => Err(e.into()),
    }
}

fn validate(file: &PathBuf) -> Result<()> {
    let workflow = load(file)?;
    beacon_core::expr::resolver::preflight(&workflow).map_err(print_validation)?;
    check_graphs(&workflow.steps)?;
    println!(
        "{}: {} step(s), {} input(s), OK",
        workflow.name,
        workflow.steps.len(),
        workflow.inputs.len()
    );
    Ok(())
}

fn check_graphs(steps: &[beacon_core::WorkflowStep]) -> Result<()> {
    beacon_core::analyze(steps)?;
    for step in steps {
        for body in step.nested_bodies() {
            check_graphs(body)?;
        }
    }
    Ok(())
}

fn graph(file: &PathBuf) -> Result<()> {
    let workflow = load(file)?;
    let plan = beacon_core::analyze(&workflow.steps)?;
    for (index, wave) in plan.waves.iter().enumerate() {
        println!("wave {index}: {}", wave.join(", "));
    }
    Ok(())
}

async fn run(
    file: &PathBuf,
    raw_inputs: &[String],
    quiet: bool,
    project_root: Option<PathBuf>,
) -> Result<()> {
    let workflow = load(file)?;

    let root = match project_root {
        Some(root) => root,
        None => file
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let mut config = EngineConfig::from_env();
    config.project_root = root;
    let executor = Arc::new(WorkflowExecutor::new(config)?);

    let mut inputs = serde_json::Map::new();
    for pair in raw_inputs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("input `{pair}` is not key=value"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        inputs.insert(key.to_string(), value);
    }

    let workflow_id = workflow.id.clone();
    executor.register(workflow).map_err(print_validation)?;

    let mut events = executor.events().subscribe_all();
    let printer = if quiet {
        None
    } else {
        Some(tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
        }))
    };

    let run_id = executor
        .start(&workflow_id, serde_json::Value::Object(inputs))
        .await
        .map_err(print_validation)?;
    let run = executor.wait(&run_id).await?;

    if let Some(printer) = printer {
        printer.abort();
    }

    println!("{}", serde_json::to_string_pretty(&run)?);

    if run.status != RunStatus::Completed {
        anyhow::bail!("run finished with status {}", run.status);
    }
    Ok(())
}

fn print_validation(err: EngineError) -> anyhow::Error {
    if let EngineError::Validation(issues) = &err {
        eprintln!("{} issue(s):", issues.len());
        for issue in issues {
            eprintln!("  - {issue}");
        }
    }
    err.into()
}
