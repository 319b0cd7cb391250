//! `dagcore` demo CLI.
//!
//! Available sub-commands:
//! - `run`      — load a DAG definition from JSON and run it end to end.
//! - `validate` — load a DAG definition and report whether it builds a
//!   valid (acyclic, fully-resolved) plan, without running anything.
//!
//! The full scheduler-facing argv schema (`start`/`enqueue`/`dequeue`/
//! `restart`/`retry` with remote workers, queues, sockets) is an external
//! concern this binary doesn't implement; it only exercises the core.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use engine::{Condition, DagStatus, ExecutionPlan, RunContext, Runner, Scope, Step, StepMap};
use store::{Attempt, InMemoryAttempt};
use tracing::info;

#[derive(Parser)]
#[command(name = "dagcore", about = "DAG runtime core demo", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a DAG definition end to end and print its final status.
    Run {
        /// Path to the DAG definition JSON file.
        path: PathBuf,
        /// Bound on concurrently-running steps (0 = unbounded).
        #[arg(long, default_value_t = 0)]
        max_active_steps: usize,
        /// Directory step logs are written under.
        #[arg(long, default_value = "./dagcore-logs")]
        log_dir: PathBuf,
    },
    /// Parse a DAG definition and report whether it builds a valid plan.
    Validate {
        /// Path to the DAG definition JSON file.
        path: PathBuf,
    },
}

/// The JSON shape the demo CLI loads: a DAG name, its steps, optional
/// DAG-level env and preconditions, and the shell steps default to
/// (spec.md §3/§4.4). DAG-definition parsing beyond this is out of scope.
#[derive(serde::Deserialize)]
struct DagDefinition {
    name: String,
    steps: Vec<Step>,
    #[serde(default)]
    env: Vec<(String, String)>,
    #[serde(default)]
    preconditions: Vec<Condition>,
    #[serde(default = "default_shell")]
    shell: String,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn load_dag(path: &PathBuf) -> DagDefinition {
    let content =
        std::fs::read_to_string(path).unwrap_or_else(|e| panic!("cannot read file {}: {e}", path.display()));
    serde_json::from_str(&content).unwrap_or_else(|e| panic!("invalid DAG definition: {e}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let dag = load_dag(&path);
            match ExecutionPlan::new(dag.steps) {
                Ok(plan) => {
                    println!("DAG \"{}\" is valid: {} steps.", dag.name, plan.nodes().len());
                }
                Err(e) => {
                    eprintln!("DAG \"{}\" is invalid: {e}", dag.name);
                    std::process::exit(1);
                }
            }
        }
        Command::Run { path, max_active_steps, log_dir } => {
            let dag = load_dag(&path);
            let run_id = uuid::Uuid::new_v4().to_string();
            info!(run_id = %run_id, dag = %dag.name, "starting run");

            let plan = ExecutionPlan::new(dag.steps).unwrap_or_else(|e| panic!("invalid DAG: {e}"));

            let attempt = Arc::new(InMemoryAttempt::new());
            attempt.open().await.expect("failed to open run store");

            let run_ctx = RunContext::new(run_id.clone(), log_dir.join(&run_id));
            let scope = Scope::new(vec![], HashMap::new(), HashMap::new(), dag.env, StepMap::new(), dag.shell, vec!["-c".into()]);

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Arc<engine::Node>>();
            let progress_task = tokio::spawn(async move {
                while let Some(node) = rx.recv().await {
                    info!(step = %node.step.name, status = ?node.status(), "step finished");
                }
            });

            let runner = Runner::new(max_active_steps);
            let outcome = runner
                .run(&plan, &run_ctx, &scope, &dag.preconditions, None, Some(&tx))
                .await
                .unwrap_or_else(|e| panic!("run failed: {e}"));
            drop(tx);
            let _ = progress_task.await;

            attempt.close().await.expect("failed to close run store");

            println!("DAG \"{}\" finished: {:?}", dag.name, outcome.status);
            println!(
                "nodes: {} total, {} completed, {} failed, {} skipped, {} canceled",
                outcome.metrics.total_nodes,
                outcome.metrics.completed_nodes,
                outcome.metrics.failed_nodes,
                outcome.metrics.skipped_nodes,
                outcome.metrics.canceled_nodes,
            );

            if !matches!(outcome.status, DagStatus::Succeeded | DagStatus::PartiallySucceeded) {
                std::process::exit(1);
            }
        }
    }
}
