//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use stagegraph_config::{EdgeDef, ProjectDef, StageDef};
use stagegraph_engine::{
  Runtime, RuntimeConfig, StageCompute, StageContext, StageFailure, StageOutcome, VariableMap,
};
use tokio_util::sync::CancellationToken;

/// Deterministic test compute.
///
/// Every declared output of a stage gets `base + sum(integer inputs)`, where
/// `base` is the stage's `base` param (default 1). Calls are recorded.
#[derive(Default)]
pub struct Pipeline {
  pub calls: Mutex<Vec<String>>,
  pub failing: Mutex<HashSet<String>>,
  pub panicking: HashSet<String>,
  pub dropping_outputs: HashSet<String>,
  pub cancelling: HashSet<String>,
  /// Fired as soon as the named stage is called, before it fails or returns.
  pub cancel_after: Option<(String, CancellationToken)>,
  pub delay: Option<Duration>,
  pub in_flight: AtomicUsize,
  pub peak: AtomicUsize,
}

impl Pipeline {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail(&self, stage: &str) {
    self.failing.lock().unwrap().insert(stage.to_string());
  }

  pub fn recover(&self, stage: &str) {
    self.failing.lock().unwrap().remove(stage);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn clear_calls(&self) {
    self.calls.lock().unwrap().clear();
  }
}

impl StageCompute for Pipeline {
  fn compute(&self, ctx: &StageContext, inputs: &VariableMap) -> Result<VariableMap, StageFailure> {
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      std::thread::sleep(delay);
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    self.calls.lock().unwrap().push(ctx.stage.clone());
    if let Some((stage, token)) = &self.cancel_after {
      if *stage == ctx.stage {
        token.cancel();
      }
    }

    if self.panicking.contains(&ctx.stage) {
      panic!("stage {} exploded", ctx.stage);
    }
    if self.cancelling.contains(&ctx.stage) {
      return Err(StageFailure::Cancelled);
    }
    if self.failing.lock().unwrap().contains(&ctx.stage) {
      return Err(StageFailure::failed(format!("{} failed", ctx.stage)));
    }
    if self.dropping_outputs.contains(&ctx.stage) {
      return Ok(VariableMap::new());
    }

    let base = ctx.params.get("base").and_then(Value::as_i64).unwrap_or(1);
    let total = base + inputs.values().filter_map(Value::as_i64).sum::<i64>();
    Ok(
      ctx
        .outputs
        .iter()
        .map(|name| (name.clone(), json!(total)))
        .collect(),
    )
  }
}

pub fn project(stages: Vec<StageDef>, edges: &[(&str, &str, &str)]) -> ProjectDef {
  ProjectDef {
    name: "test".to_string(),
    stages,
    edges: edges
      .iter()
      .map(|(var, from, to)| EdgeDef::new(*var, *from, *to))
      .collect(),
  }
}

pub fn stages(ids: &[&str]) -> Vec<StageDef> {
  ids.iter().map(|id| StageDef::new(*id)).collect()
}

pub fn runtime(project: &ProjectDef) -> Runtime {
  Runtime::from_project(project, RuntimeConfig { max_concurrency: 4 }).unwrap()
}

/// `load` feeds `plot` one variable.
pub fn loader_plot() -> ProjectDef {
  project(stages(&["load", "plot"]), &[("trials", "load", "plot")])
}

/// `src` feeds c1, c2, c3; c1 feeds `leaf`; `other` stands alone.
pub fn fan_out() -> ProjectDef {
  project(
    stages(&["src", "c1", "c2", "c3", "leaf", "other"]),
    &[
      ("v", "src", "c1"),
      ("v", "src", "c2"),
      ("v", "src", "c3"),
      ("w", "c1", "leaf"),
    ],
  )
}

/// a -> b -> c, plus a -> d.
pub fn diamond_free_chain() -> ProjectDef {
  project(
    stages(&["a", "b", "c", "d"]),
    &[("v", "a", "b"), ("w", "b", "c"), ("u", "a", "d")],
  )
}

pub fn ran(outcome: Option<&StageOutcome>) -> bool {
  matches!(outcome, Some(StageOutcome::RanOk))
}

pub fn skipped(outcome: Option<&StageOutcome>) -> bool {
  matches!(outcome, Some(StageOutcome::SkippedClean))
}
