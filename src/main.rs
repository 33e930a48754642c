use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stagegraph_config::ProjectDef;
use stagegraph_engine::{
  Fingerprint, RunOptions, RunReport, Runtime, RuntimeConfig, StageCompute, StageContext,
  StageFailure, StageOutcome, VariableMap,
};
use stagegraph_graph::{DependencyGraph, StageId, order};

/// Stagegraph - incremental execution of analysis pipelines
#[derive(Parser)]
#[command(name = "stagegraph")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the execution order of a project
  Order {
    /// Path to the project file (JSON)
    project_file: PathBuf,
  },

  /// Show how one stage is wired into the graph
  Inspect {
    /// Path to the project file (JSON)
    project_file: PathBuf,

    /// The stage ID to inspect
    #[arg(long)]
    stage: String,
  },

  /// Run a project with the built-in compute
  Run {
    /// Path to the project file (JSON)
    project_file: PathBuf,

    /// Number of runs to perform against the same runtime
    #[arg(long, default_value_t = 1)]
    passes: usize,

    /// Stage to invalidate before every pass after the first
    #[arg(long)]
    invalidate: Vec<String>,

    /// Run independent stages in parallel
    #[arg(long)]
    concurrent: bool,

    /// Upper bound on stages in flight (concurrent mode)
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Only run this stage and everything downstream of it
    #[arg(long)]
    from: Option<String>,

    /// Run selected stages even when they are clean
    #[arg(long)]
    force: bool,
  },
}

fn main() -> Result<()> {
  init_tracing();
  let cli = Cli::parse();

  match cli.command {
    Some(Commands::Order { project_file }) => print_order(project_file)?,
    Some(Commands::Inspect {
      project_file,
      stage,
    }) => inspect_stage(project_file, stage)?,
    Some(Commands::Run {
      project_file,
      passes,
      invalidate,
      concurrent,
      max_concurrency,
      from,
      force,
    }) => {
      let options = RunOptions { from, force };
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async {
        run_project(
          project_file,
          passes,
          invalidate,
          concurrent,
          max_concurrency,
          options,
        )
        .await
      })?;
    }
    None => {
      println!("stagegraph - use --help to see available commands");
    }
  }

  Ok(())
}

fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

fn load_project(project_file: &Path) -> Result<ProjectDef> {
  ProjectDef::load(project_file)
    .with_context(|| format!("failed to load project file: {}", project_file.display()))
}

fn build_graph(project_file: &Path) -> Result<DependencyGraph> {
  let project = load_project(project_file)?;
  eprintln!("Loaded project: {}", project.name);
  DependencyGraph::from_project(&project).context("failed to build dependency graph")
}

fn print_order(project_file: PathBuf) -> Result<()> {
  let graph = build_graph(&project_file)?;
  let ordered = order(&graph).context("failed to order project")?;

  for stage in ordered {
    println!("{}", graph.stage_name(stage));
  }
  Ok(())
}

fn inspect_stage(project_file: PathBuf, stage_id: String) -> Result<()> {
  let graph = build_graph(&project_file)?;
  let stage = graph
    .lookup(&stage_id)
    .with_context(|| format!("stage '{}' not found in project", stage_id))?;

  let names = |stages: &[StageId]| -> Vec<String> {
    stages
      .iter()
      .map(|s| graph.stage_name(*s).to_string())
      .collect()
  };
  let inputs: Vec<Value> = graph
    .inputs(stage)
    .iter()
    .map(|key| {
      json!({
        "variable": graph.variable_name(key.name),
        "from": graph.stage_name(key.producer),
      })
    })
    .collect();
  let outputs: Vec<&str> = graph
    .outputs(stage)
    .iter()
    .map(|var| graph.variable_name(*var))
    .collect();
  let info = graph.stage(stage);

  let output = json!({
    "stage": info.name,
    "kind": info.kind,
    "logicVersion": info.logic_version,
    "params": info.params,
    "inputs": inputs,
    "outputs": outputs,
    "upstream": names(graph.upstream(stage)),
    "downstream": names(graph.downstream(stage)),
    "ancestors": names(&graph.ancestors(stage)),
    "descendants": names(&graph.descendants(stage)),
  });
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn run_project(
  project_file: PathBuf,
  passes: usize,
  invalidate: Vec<String>,
  concurrent: bool,
  max_concurrency: Option<usize>,
  options: RunOptions,
) -> Result<()> {
  let graph = build_graph(&project_file)?;
  eprintln!("Built graph with {} stages", graph.len());

  let mut config = RuntimeConfig::default();
  if let Some(max) = max_concurrency {
    config.max_concurrency = max;
  }
  let mut runtime = Runtime::new(graph, config);
  let compute = Arc::new(BuiltinCompute);

  let cancel = CancellationToken::new();
  let on_interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      on_interrupt.cancel();
    }
  });

  let mut failed_passes = Vec::new();
  for pass in 1..=passes.max(1) {
    if pass > 1 {
      for stage in &invalidate {
        runtime
          .invalidate(stage)
          .with_context(|| format!("failed to invalidate stage '{}'", stage))?;
      }
    }

    let result = if concurrent {
      runtime
        .run_concurrent_with_options(Arc::clone(&compute), &options, cancel.clone())
        .await
    } else {
      runtime.run_with_options(compute.as_ref(), &options, &cancel)
    };
    let report = result.context("run aborted")?;

    eprintln!("Pass {}: {}", pass, summarize(&report));
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_success() {
      failed_passes.push(pass);
    }
    if cancel.is_cancelled() {
      break;
    }
  }

  if !failed_passes.is_empty() {
    bail!("passes {:?} did not complete successfully", failed_passes);
  }
  Ok(())
}

fn summarize(report: &RunReport) -> String {
  let count = |predicate: fn(&StageOutcome) -> bool| report.stages_where(predicate).len();
  format!(
    "ran {}, skipped {}, failed {}, blocked {}, cancelled {}, not selected {}",
    count(|o| matches!(o, StageOutcome::RanOk)),
    count(|o| matches!(o, StageOutcome::SkippedClean)),
    count(|o| matches!(o, StageOutcome::Failed(_))),
    count(|o| matches!(o, StageOutcome::Blocked(_))),
    count(|o| matches!(o, StageOutcome::Cancelled)),
    count(|o| matches!(o, StageOutcome::NotSelected)),
  )
}

/// Deterministic stand-in for real stage logic.
///
/// Every declared output is derived from the stage, the variable name and the
/// fingerprint of the stage's inputs, so identical inputs give identical values.
struct BuiltinCompute;

impl StageCompute for BuiltinCompute {
  fn compute(&self, ctx: &StageContext, inputs: &VariableMap) -> Result<VariableMap, StageFailure> {
    if ctx.is_cancelled() {
      return Err(StageFailure::Cancelled);
    }

    let inputs: serde_json::Map<String, Value> = inputs
      .iter()
      .map(|(name, value)| (name.clone(), value.clone()))
      .collect();
    let digest = Fingerprint::of_value(&Value::Object(inputs));

    Ok(
      ctx
        .outputs
        .iter()
        .map(|name| {
          let value = json!({
            "stage": ctx.stage,
            "variable": name,
            "kind": ctx.kind,
            "params": ctx.params,
            "inputs": digest.to_string(),
          });
          (name.clone(), value)
        })
        .collect(),
    )
  }
}
