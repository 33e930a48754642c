//! Per-stage staleness tracking.
//!
//! A stage needs to run when it has never run successfully, when it was
//! marked dirty (directly or through an upstream invalidation), when its logic
//! version changed, or when the fingerprint of its inputs no longer matches
//! the one recorded at its last successful run.

use serde::Serialize;
use stagegraph_graph::{DependencyGraph, StageId};
use tracing::debug;

use crate::fingerprint::Fingerprint;
use crate::store::VariableStore;

/// Tag for fingerprints of a missing (never materialized) input.
const MISSING_INPUT: &str = "missing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
  /// Outputs are consistent with the inputs and logic they were computed from.
  Clean,
  /// Outputs may be stale.
  Dirty,
  /// The last attempt failed.
  Failed,
  /// The last attempt was skipped because an ancestor failed.
  Blocked,
}

impl StageStatus {
  /// Whether the stage must be re-evaluated regardless of fingerprints.
  pub fn needs_run(self) -> bool {
    !matches!(self, StageStatus::Clean)
  }
}

/// Why a stage is considered dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyReason {
  NeverRun,
  Marked,
  PreviouslyFailed,
  PreviouslyBlocked,
  LogicChanged,
  InputsChanged,
  /// Clean, but the run was asked to execute it anyway.
  Forced,
}

/// Result of evaluating a stage against the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
  /// Current input fingerprint.
  pub fingerprint: Fingerprint,
  /// `None` when the stage is clean.
  pub reason: Option<DirtyReason>,
}

impl Freshness {
  pub fn is_dirty(&self) -> bool {
    self.reason.is_some()
  }
}

#[derive(Debug, Clone)]
struct StageRecord {
  status: StageStatus,
  input_fingerprint: Option<Fingerprint>,
  logic_version: Option<String>,
}

impl StageRecord {
  fn never_run() -> Self {
    Self {
      status: StageStatus::Dirty,
      input_fingerprint: None,
      logic_version: None,
    }
  }
}

/// Mutable staleness state attached to an immutable graph.
///
/// One record per stage, indexed by [`StageId`]. Owned by a single runtime;
/// concurrent coordinators must not share one tracker.
#[derive(Debug, Clone)]
pub struct ProvenanceTracker {
  records: Vec<StageRecord>,
}

impl ProvenanceTracker {
  /// A tracker where every stage has yet to run.
  pub fn new(graph: &DependencyGraph) -> Self {
    Self {
      records: vec![StageRecord::never_run(); graph.len()],
    }
  }

  /// Keep the state of stages that survive a rebuild, matched by identifier.
  /// New stages start as never run.
  pub fn carry_over(
    old_graph: &DependencyGraph,
    old: &ProvenanceTracker,
    new_graph: &DependencyGraph,
  ) -> Self {
    let records = new_graph
      .stages()
      .iter()
      .map(|stage| {
        old_graph
          .lookup(&stage.name)
          .and_then(|previous| old.records.get(previous.index()))
          .cloned()
          .unwrap_or_else(StageRecord::never_run)
      })
      .collect();
    Self { records }
  }

  pub fn status(&self, stage: StageId) -> StageStatus {
    self.records[stage.index()].status
  }

  /// Input fingerprint recorded at the stage's last successful run.
  pub fn recorded_fingerprint(&self, stage: StageId) -> Option<Fingerprint> {
    self.records[stage.index()].input_fingerprint
  }

  /// Mark a stage and everything downstream of it dirty.
  ///
  /// Walks the whole downstream cone with an explicit work-list and a visited
  /// set. Clean stages become dirty; failed and blocked stages keep their
  /// status but are still walked through, so clean stages behind them are
  /// reached. Returns the stages whose status changed, in visit order.
  pub fn mark_dirty(&mut self, graph: &DependencyGraph, stage: StageId) -> Vec<StageId> {
    let mut changed = Vec::new();
    let mut visited = vec![false; graph.len()];
    visited[stage.index()] = true;

    if !self.status(stage).needs_run() {
      changed.push(stage);
    }
    self.records[stage.index()].status = StageStatus::Dirty;

    let mut work: Vec<StageId> = graph.downstream(stage).iter().rev().copied().collect();
    while let Some(next) = work.pop() {
      if std::mem::replace(&mut visited[next.index()], true) {
        continue;
      }
      if self.status(next) == StageStatus::Clean {
        self.records[next.index()].status = StageStatus::Dirty;
        changed.push(next);
      }
      work.extend(
        graph
          .downstream(next)
          .iter()
          .rev()
          .filter(|child| !visited[child.index()]),
      );
    }

    debug!(
      stage = %graph.stage_name(stage),
      newly_dirty = changed.len(),
      "marked dirty"
    );
    changed
  }

  /// Combine the fingerprints of everything a stage consumes with its
  /// declared parameters.
  ///
  /// Each input contributes (variable name, producer, value fingerprint); each
  /// parameter contributes (key, canonical value). Components are combined
  /// order-independently.
  pub fn compute_input_fingerprint(
    graph: &DependencyGraph,
    store: &VariableStore,
    stage: StageId,
  ) -> Fingerprint {
    let inputs = graph.inputs(stage).iter().map(|key| {
      let name = graph.variable_name(key.name);
      let producer = graph.stage_name(key.producer);
      let value = store
        .resolve(graph, *key)
        .map(|variable| variable.fingerprint)
        .unwrap_or_else(|| Fingerprint::of_bytes(MISSING_INPUT.as_bytes()));
      Fingerprint::of_fields(
        "input",
        &[name.as_bytes(), producer.as_bytes(), value.as_bytes().as_slice()],
      )
    });

    let params = graph.stage(stage).params.iter().map(|(key, value)| {
      Fingerprint::of_fields(
        "param",
        &[key.as_bytes(), Fingerprint::of_value(value).as_bytes().as_slice()],
      )
    });

    Fingerprint::combine_unordered("stage-inputs", inputs.chain(params))
  }

  /// Evaluate a stage against current inputs and its recorded state.
  pub fn check(&self, graph: &DependencyGraph, store: &VariableStore, stage: StageId) -> Freshness {
    let fingerprint = Self::compute_input_fingerprint(graph, store, stage);
    let record = &self.records[stage.index()];

    let reason = match (record.status, &record.logic_version, record.input_fingerprint) {
      (_, None, _) | (_, _, None) => Some(DirtyReason::NeverRun),
      (StageStatus::Dirty, _, _) => Some(DirtyReason::Marked),
      (StageStatus::Failed, _, _) => Some(DirtyReason::PreviouslyFailed),
      (StageStatus::Blocked, _, _) => Some(DirtyReason::PreviouslyBlocked),
      (StageStatus::Clean, Some(version), _) if *version != graph.stage(stage).logic_version => {
        Some(DirtyReason::LogicChanged)
      }
      (StageStatus::Clean, _, Some(recorded)) if recorded != fingerprint => {
        Some(DirtyReason::InputsChanged)
      }
      (StageStatus::Clean, _, _) => None,
    };

    Freshness {
      fingerprint,
      reason,
    }
  }

  /// Whether a stage must run before its outputs can be trusted.
  pub fn is_dirty(&self, graph: &DependencyGraph, store: &VariableStore, stage: StageId) -> bool {
    self.check(graph, store, stage).is_dirty()
  }

  /// Record a successful run.
  pub fn record_success(&mut self, stage: StageId, fingerprint: Fingerprint, logic_version: &str) {
    let record = &mut self.records[stage.index()];
    record.status = StageStatus::Clean;
    record.input_fingerprint = Some(fingerprint);
    record.logic_version = Some(logic_version.to_string());
  }

  pub fn record_failure(&mut self, stage: StageId) {
    self.records[stage.index()].status = StageStatus::Failed;
  }

  pub fn record_blocked(&mut self, stage: StageId) {
    self.records[stage.index()].status = StageStatus::Blocked;
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use stagegraph_config::{EdgeDef, StageDef};

  use super::*;
  use crate::compute::VariableMap;
  use crate::store::Provenance;

  fn fan_out_graph() -> DependencyGraph {
    // src feeds c1..c3 with one shared variable; c1 feeds leaf; other is unrelated.
    DependencyGraph::build(
      &[
        StageDef::new("src"),
        StageDef::new("c1"),
        StageDef::new("c2"),
        StageDef::new("c3"),
        StageDef::new("leaf"),
        StageDef::new("other"),
      ],
      &[
        EdgeDef::new("v", "src", "c1"),
        EdgeDef::new("v", "src", "c2"),
        EdgeDef::new("v", "src", "c3"),
        EdgeDef::new("w", "c1", "leaf"),
      ],
    )
    .unwrap()
  }

  fn all_clean(graph: &DependencyGraph, store: &VariableStore) -> ProvenanceTracker {
    let mut tracker = ProvenanceTracker::new(graph);
    for stage in graph.stage_ids() {
      let fp = ProvenanceTracker::compute_input_fingerprint(graph, store, stage);
      tracker.record_success(stage, fp, &graph.stage(stage).logic_version);
    }
    tracker
  }

  fn names(graph: &DependencyGraph, stages: &[StageId]) -> Vec<String> {
    let mut names: Vec<String> = stages
      .iter()
      .map(|s| graph.stage_name(*s).to_string())
      .collect();
    names.sort();
    names
  }

  #[test]
  fn test_new_tracker_is_all_dirty() {
    let graph = fan_out_graph();
    let store = VariableStore::new(&graph);
    let tracker = ProvenanceTracker::new(&graph);
    for stage in graph.stage_ids() {
      assert_eq!(
        tracker.check(&graph, &store, stage).reason,
        Some(DirtyReason::NeverRun)
      );
    }
  }

  #[test]
  fn test_mark_dirty_fans_out_to_consumers_only() {
    let graph = fan_out_graph();
    let store = VariableStore::new(&graph);
    let mut tracker = all_clean(&graph, &store);

    let changed = tracker.mark_dirty(&graph, graph.lookup("src").unwrap());
    assert_eq!(
      names(&graph, &changed),
      vec!["c1", "c2", "c3", "leaf", "src"]
    );
    assert_eq!(
      tracker.status(graph.lookup("other").unwrap()),
      StageStatus::Clean
    );
    assert!(!tracker.is_dirty(&graph, &store, graph.lookup("other").unwrap()));
  }

  #[test]
  fn test_mark_dirty_is_idempotent() {
    let graph = fan_out_graph();
    let store = VariableStore::new(&graph);
    let mut tracker = all_clean(&graph, &store);
    let src = graph.lookup("src").unwrap();

    tracker.mark_dirty(&graph, src);
    assert!(tracker.mark_dirty(&graph, src).is_empty());
  }

  #[test]
  fn test_mark_dirty_reaches_past_failed_stage() {
    // a -> x -> y
    let graph = DependencyGraph::build(
      &[StageDef::new("a"), StageDef::new("x"), StageDef::new("y")],
      &[EdgeDef::new("v", "a", "x"), EdgeDef::new("w", "x", "y")],
    )
    .unwrap();
    let store = VariableStore::new(&graph);
    let mut tracker = all_clean(&graph, &store);
    let x = graph.lookup("x").unwrap();
    let y = graph.lookup("y").unwrap();

    tracker.record_failure(x);
    let changed = tracker.mark_dirty(&graph, graph.lookup("a").unwrap());

    assert_eq!(names(&graph, &changed), vec!["a", "y"]);
    assert_eq!(tracker.status(x), StageStatus::Failed);
    assert_eq!(tracker.status(y), StageStatus::Dirty);
  }

  #[test]
  fn test_mark_dirty_visits_shared_descendant_once() {
    // a feeds b and c; both feed d.
    let graph = DependencyGraph::build(
      &[
        StageDef::new("a"),
        StageDef::new("b"),
        StageDef::new("c"),
        StageDef::new("d"),
      ],
      &[
        EdgeDef::new("v", "a", "b"),
        EdgeDef::new("v", "a", "c"),
        EdgeDef::new("l", "b", "d"),
        EdgeDef::new("r", "c", "d"),
      ],
    )
    .unwrap();
    let store = VariableStore::new(&graph);
    let mut tracker = all_clean(&graph, &store);

    let changed = tracker.mark_dirty(&graph, graph.lookup("a").unwrap());
    assert_eq!(names(&graph, &changed), vec!["a", "b", "c", "d"]);
  }

  #[test]
  fn test_fingerprint_independent_of_input_order() {
    let stages = [StageDef::new("a"), StageDef::new("b"), StageDef::new("join")];
    let forward = DependencyGraph::build(
      &stages,
      &[EdgeDef::new("x", "a", "join"), EdgeDef::new("y", "b", "join")],
    )
    .unwrap();
    let reversed = DependencyGraph::build(
      &stages,
      &[EdgeDef::new("y", "b", "join"), EdgeDef::new("x", "a", "join")],
    )
    .unwrap();

    let provenance = |producer: &str| Provenance {
      producer: producer.to_string(),
      input_fingerprint: Fingerprint::of_bytes(b""),
      logic_version: "0".to_string(),
      run_id: "r".to_string(),
      inputs: Vec::new(),
    };
    let fill = |graph: &DependencyGraph| {
      let mut store = VariableStore::new(graph);
      store.replace(
        graph.lookup("a").unwrap(),
        VariableMap::from([("x".to_string(), json!([1, 2, 3]))]),
        &provenance("a"),
      );
      store.replace(
        graph.lookup("b").unwrap(),
        VariableMap::from([("y".to_string(), json!({"k": "v"}))]),
        &provenance("b"),
      );
      store
    };

    let fp_forward = ProvenanceTracker::compute_input_fingerprint(
      &forward,
      &fill(&forward),
      forward.lookup("join").unwrap(),
    );
    let fp_reversed = ProvenanceTracker::compute_input_fingerprint(
      &reversed,
      &fill(&reversed),
      reversed.lookup("join").unwrap(),
    );
    assert_eq!(fp_forward, fp_reversed);
  }

  #[test]
  fn test_params_change_fingerprint() {
    let plain = DependencyGraph::build(&[StageDef::new("a")], &[]).unwrap();
    let tuned =
      DependencyGraph::build(&[StageDef::new("a").with_param("cutoff", json!(6))], &[]).unwrap();
    let a = plain.lookup("a").unwrap();

    assert_ne!(
      ProvenanceTracker::compute_input_fingerprint(&plain, &VariableStore::new(&plain), a),
      ProvenanceTracker::compute_input_fingerprint(&tuned, &VariableStore::new(&tuned), a)
    );
  }

  #[test]
  fn test_logic_version_change_detected() {
    let v1 = DependencyGraph::build(&[StageDef::new("a").with_version("1")], &[]).unwrap();
    let v2 = DependencyGraph::build(&[StageDef::new("a").with_version("2")], &[]).unwrap();
    let store = VariableStore::new(&v1);
    let tracker = all_clean(&v1, &store);
    let a = v1.lookup("a").unwrap();

    assert!(!tracker.is_dirty(&v1, &store, a));
    let carried = ProvenanceTracker::carry_over(&v1, &tracker, &v2);
    assert_eq!(
      carried.check(&v2, &store, a).reason,
      Some(DirtyReason::LogicChanged)
    );
  }

  #[test]
  fn test_failed_and_blocked_need_run() {
    let graph = fan_out_graph();
    let store = VariableStore::new(&graph);
    let mut tracker = all_clean(&graph, &store);
    let c1 = graph.lookup("c1").unwrap();
    let leaf = graph.lookup("leaf").unwrap();

    tracker.record_failure(c1);
    tracker.record_blocked(leaf);
    assert_eq!(
      tracker.check(&graph, &store, c1).reason,
      Some(DirtyReason::PreviouslyFailed)
    );
    assert_eq!(
      tracker.check(&graph, &store, leaf).reason,
      Some(DirtyReason::PreviouslyBlocked)
    );
  }
}
