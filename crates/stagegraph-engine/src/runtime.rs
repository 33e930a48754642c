//! Pipeline runtime.
//!
//! The [`Runtime`] owns a dependency graph together with the mutable state
//! attached to it (staleness records and cached values) and re-executes the
//! minimal set of stages on each run.

use std::sync::Arc;

use stagegraph_config::ProjectDef;
use stagegraph_graph::{DependencyGraph, StageId, order};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::compute::{StageCompute, StageContext, StageFailure, VariableMap};
use crate::error::{BlockedError, RuntimeError, StageError};
use crate::events::{NoopNotifier, RunEvent, RunNotifier};
use crate::fingerprint::Fingerprint;
use crate::provenance::{DirtyReason, ProvenanceTracker, StageStatus};
use crate::report::{RunReport, StageOutcome, StageReport, VariableRef};
use crate::store::{ConsumedInput, Provenance, StoredVariable, VariableStore};

/// Configuration for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Upper bound on compute callbacks in flight during a concurrent run.
  pub max_concurrency: usize,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      max_concurrency: std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1),
    }
  }
}

/// Which part of the graph a run covers and how clean stages are treated.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  /// Restrict the run to this stage and everything downstream of it.
  pub from: Option<String>,
  /// Execute every selected stage, clean or not.
  pub force: bool,
}

impl RunOptions {
  pub fn from_stage(stage: impl Into<String>) -> Self {
    Self {
      from: Some(stage.into()),
      force: false,
    }
  }

  pub fn forced(mut self) -> Self {
    self.force = true;
    self
  }
}

/// Stages a run covers, resolved against the current graph.
#[derive(Debug, Clone)]
pub(crate) struct Selection {
  selected: Vec<bool>,
  force: bool,
}

impl Selection {
  pub(crate) fn all(stages: usize) -> Self {
    Self {
      selected: vec![true; stages],
      force: false,
    }
  }

  pub(crate) fn contains(&self, stage: StageId) -> bool {
    self.selected[stage.index()]
  }
}

/// How a stage ended up within one run, as seen by its consumers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settled {
  /// Outputs are materialized (fresh or reused).
  Available,
  /// The stage or one of its ancestors failed. `root` is the failed stage.
  Failed { root: String },
  Cancelled,
}

/// Decision for a stage whose dependencies have all settled.
pub(crate) enum Prepared {
  /// No compute needed: skipped, blocked, or failed before launch.
  Done {
    report: StageReport,
    settled: Settled,
  },
  /// Dirty stage ready to hand to the compute callback.
  Launch {
    ctx: StageContext,
    inputs: VariableMap,
    launched: Launched,
    reason: DirtyReason,
  },
}

/// What [`Runtime::finish`] needs to record a launched stage.
#[derive(Debug)]
pub(crate) struct Launched {
  pub(crate) stage: StageId,
  pub(crate) fingerprint: Fingerprint,
  pub(crate) consumed: Vec<ConsumedInput>,
}

/// The pipeline runtime.
///
/// Handles ordering, staleness checks and bookkeeping; delegates the actual
/// work of each stage to a [`StageCompute`].
pub struct Runtime {
  pub(crate) graph: Arc<DependencyGraph>,
  pub(crate) tracker: ProvenanceTracker,
  pub(crate) store: VariableStore,
  pub(crate) config: RuntimeConfig,
  pub(crate) notifier: Arc<dyn RunNotifier>,
}

impl Runtime {
  /// Create a runtime for a built graph. Every stage starts dirty.
  pub fn new(graph: DependencyGraph, config: RuntimeConfig) -> Self {
    Self {
      tracker: ProvenanceTracker::new(&graph),
      store: VariableStore::new(&graph),
      graph: Arc::new(graph),
      config,
      notifier: Arc::new(NoopNotifier),
    }
  }

  /// Build the graph from project declarations and create a runtime for it.
  pub fn from_project(project: &ProjectDef, config: RuntimeConfig) -> Result<Self, RuntimeError> {
    let graph = DependencyGraph::from_project(project)?;
    Ok(Self::new(graph, config))
  }

  /// Attach a notifier that receives [`RunEvent`]s.
  pub fn with_notifier(mut self, notifier: Arc<dyn RunNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn graph(&self) -> &Arc<DependencyGraph> {
    &self.graph
  }

  pub fn tracker(&self) -> &ProvenanceTracker {
    &self.tracker
  }

  pub fn store(&self) -> &VariableStore {
    &self.store
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  /// Current status of a stage by identifier.
  pub fn status(&self, stage: &str) -> Option<StageStatus> {
    self.graph.lookup(stage).map(|id| self.tracker.status(id))
  }

  /// A cached variable with its provenance.
  pub fn variable(&self, stage: &str, variable: &str) -> Option<&StoredVariable> {
    let id = self.graph.lookup(stage)?;
    self.store.get(id, variable)
  }

  /// A cached variable's value.
  pub fn value(&self, stage: &str, variable: &str) -> Option<&serde_json::Value> {
    self.variable(stage, variable).map(|stored| &stored.value)
  }

  /// Force a stage (and everything downstream) to re-run on the next run.
  ///
  /// Returns the identifiers of stages that were clean and are now dirty.
  pub fn invalidate(&mut self, stage: &str) -> Result<Vec<String>, RuntimeError> {
    let id = self.lookup(stage)?;
    let changed = self.tracker.mark_dirty(&self.graph, id);
    info!(stage = %stage, newly_dirty = changed.len(), "stage_invalidated");
    Ok(
      changed
        .into_iter()
        .map(|s| self.graph.stage_name(s).to_string())
        .collect(),
    )
  }

  /// Replace the graph after the project declarations changed.
  ///
  /// Stages are matched by identifier. Clean state and cached values carry
  /// over; a stage whose declared outputs are not all cached is marked dirty.
  pub fn rebuild(&mut self, graph: DependencyGraph) {
    let tracker = ProvenanceTracker::carry_over(&self.graph, &self.tracker, &graph);
    let store = VariableStore::carry_over(&self.graph, std::mem::take(&mut self.store), &graph);
    self.graph = Arc::new(graph);
    self.tracker = tracker;
    self.store = store;

    let graph = Arc::clone(&self.graph);
    for stage in graph.stage_ids() {
      let missing_output = graph
        .outputs(stage)
        .iter()
        .any(|name| self.store.get(stage, graph.variable_name(*name)).is_none());
      if missing_output && !self.tracker.status(stage).needs_run() {
        self.tracker.mark_dirty(&graph, stage);
      }
    }

    info!(stages = graph.len(), "graph_rebuilt");
  }

  /// Run every stage that needs it, sequentially, in topological order.
  pub fn run<C>(&mut self, compute: &C) -> Result<RunReport, RuntimeError>
  where
    C: StageCompute + ?Sized,
  {
    self.run_with_options(compute, &RunOptions::default(), &CancellationToken::new())
  }

  /// Sequential run that stops launching stages once `cancel` fires.
  pub fn run_with_cancel<C>(
    &mut self,
    compute: &C,
    cancel: &CancellationToken,
  ) -> Result<RunReport, RuntimeError>
  where
    C: StageCompute + ?Sized,
  {
    self.run_with_options(compute, &RunOptions::default(), cancel)
  }

  /// Sequential run restricted to `stage` and its descendants.
  ///
  /// Every other stage is reported [`StageOutcome::NotSelected`] and keeps
  /// its cached outputs, which the selected stages read as inputs.
  pub fn run_from<C>(&mut self, stage: &str, compute: &C) -> Result<RunReport, RuntimeError>
  where
    C: StageCompute + ?Sized,
  {
    self.run_with_options(
      compute,
      &RunOptions::from_stage(stage),
      &CancellationToken::new(),
    )
  }

  /// Sequential run with an explicit selection and force flag.
  pub fn run_with_options<C>(
    &mut self,
    compute: &C,
    options: &RunOptions,
    cancel: &CancellationToken,
  ) -> Result<RunReport, RuntimeError>
  where
    C: StageCompute + ?Sized,
  {
    let order = order(&self.graph)?;
    let selection = self.select(options)?;
    Ok(self.execute(&order, &selection, compute, cancel))
  }

  /// Sequential run over a caller-supplied order.
  ///
  /// The order must list every stage exactly once with producers before
  /// consumers; anything else is rejected before a stage executes.
  pub fn run_ordered<C>(
    &mut self,
    order: &[StageId],
    compute: &C,
    cancel: &CancellationToken,
  ) -> Result<RunReport, RuntimeError>
  where
    C: StageCompute + ?Sized,
  {
    self.validate_order(order)?;
    let selection = Selection::all(self.graph.len());
    Ok(self.execute(order, &selection, compute, cancel))
  }

  #[instrument(
    name = "runtime_run",
    skip_all,
    fields(stages = order.len(), force = selection.force)
  )]
  fn execute<C>(
    &mut self,
    order: &[StageId],
    selection: &Selection,
    compute: &C,
    cancel: &CancellationToken,
  ) -> RunReport
  where
    C: StageCompute + ?Sized,
  {
    let run_id = uuid::Uuid::new_v4().to_string();
    let run_cancel = cancel.child_token();
    self.begin(&run_id);

    let mut settled: Vec<Option<Settled>> = vec![None; self.graph.len()];
    let mut entries = Vec::with_capacity(order.len());

    for &stage in order {
      let (report, outcome) = if run_cancel.is_cancelled() && selection.contains(stage) {
        (self.cancelled_report(stage), Settled::Cancelled)
      } else {
        match self.prepare(stage, &settled, selection, &run_id, &run_cancel) {
          Prepared::Done { report, settled } => (report, settled),
          Prepared::Launch {
            ctx,
            inputs,
            launched,
            reason,
          } => {
            self.started(&run_id, stage, reason);
            let result = compute.compute(&ctx, &inputs);
            if matches!(result, Err(StageFailure::Cancelled)) {
              run_cancel.cancel();
            }
            self.finish(launched, result, &run_id)
          }
        }
      };

      self.announce(&run_id, &report);
      settled[stage.index()] = Some(outcome);
      entries.push(report);
    }

    let report = RunReport { run_id, entries };
    self.end(&report);
    report
  }

  /// Resolve run options against the current graph.
  pub(crate) fn select(&self, options: &RunOptions) -> Result<Selection, RuntimeError> {
    let selected = match &options.from {
      None => vec![true; self.graph.len()],
      Some(stage) => {
        let root = self.lookup(stage)?;
        let mut selected = vec![false; self.graph.len()];
        selected[root.index()] = true;
        for descendant in self.graph.descendants(root) {
          selected[descendant.index()] = true;
        }
        selected
      }
    };
    Ok(Selection {
      selected,
      force: options.force,
    })
  }

  pub(crate) fn lookup(&self, stage: &str) -> Result<StageId, RuntimeError> {
    self
      .graph
      .lookup(stage)
      .ok_or_else(|| RuntimeError::StageNotFound {
        stage: stage.to_string(),
      })
  }

  fn validate_order(&self, order: &[StageId]) -> Result<(), RuntimeError> {
    let mut position = vec![None; self.graph.len()];
    for (i, stage) in order.iter().enumerate() {
      match position.get_mut(stage.index()) {
        Some(slot) if slot.is_none() => *slot = Some(i),
        _ => {
          return Err(RuntimeError::InvalidOrder {
            message: format!("stage {} listed twice or unknown", stage),
          });
        }
      }
    }
    if order.len() != self.graph.len() {
      return Err(RuntimeError::InvalidOrder {
        message: format!(
          "order lists {} of {} stages",
          order.len(),
          self.graph.len()
        ),
      });
    }
    for edge in self.graph.edges() {
      if position[edge.producer.index()] > position[edge.consumer.index()] {
        return Err(RuntimeError::InvalidOrder {
          message: format!(
            "'{}' must precede '{}'",
            self.graph.stage_name(edge.producer),
            self.graph.stage_name(edge.consumer)
          ),
        });
      }
    }
    Ok(())
  }

  /// Decide what to do with a stage whose upstream stages have all settled.
  pub(crate) fn prepare(
    &mut self,
    stage: StageId,
    settled: &[Option<Settled>],
    selection: &Selection,
    run_id: &str,
    cancel: &CancellationToken,
  ) -> Prepared {
    if !selection.contains(stage) {
      return Prepared::Done {
        report: self.report(stage, StageOutcome::NotSelected),
        settled: Settled::Available,
      };
    }

    let graph = Arc::clone(&self.graph);
    let name = graph.stage_name(stage).to_string();

    let mut upstream_cancelled = false;
    for upstream in graph.upstream(stage) {
      match &settled[upstream.index()] {
        Some(Settled::Available) => {}
        Some(Settled::Failed { root }) => {
          self.tracker.record_blocked(stage);
          let root = root.clone();
          return Prepared::Done {
            report: self.report(
              stage,
              StageOutcome::Blocked(BlockedError {
                stage: name,
                blocked_by: root.clone(),
              }),
            ),
            settled: Settled::Failed { root },
          };
        }
        Some(Settled::Cancelled) | None => upstream_cancelled = true,
      }
    }
    if upstream_cancelled {
      return Prepared::Done {
        report: self.cancelled_report(stage),
        settled: Settled::Cancelled,
      };
    }

    let freshness = self.tracker.check(&graph, &self.store, stage);
    let reason = match freshness.reason {
      None if selection.force => Some(DirtyReason::Forced),
      reason => reason,
    };
    let Some(reason) = reason else {
      return Prepared::Done {
        report: self.report(stage, StageOutcome::SkippedClean),
        settled: Settled::Available,
      };
    };

    let mut inputs = VariableMap::new();
    let mut consumed = Vec::with_capacity(graph.inputs(stage).len());
    for key in graph.inputs(stage) {
      let variable = graph.variable_name(key.name);
      match self.store.resolve(&graph, *key) {
        Some(stored) => {
          inputs.insert(variable.to_string(), stored.value.clone());
          consumed.push(ConsumedInput {
            producer: graph.stage_name(key.producer).to_string(),
            name: variable.to_string(),
            fingerprint: stored.fingerprint,
            run_id: stored.provenance.run_id.clone(),
          });
        }
        None => {
          let cause = format!(
            "input '{}' from '{}' is not available",
            variable,
            graph.stage_name(key.producer)
          );
          return self.fail_before_launch(stage, cause);
        }
      }
    }

    Prepared::Launch {
      ctx: StageContext::new(
        graph.stage(stage),
        graph
          .outputs(stage)
          .iter()
          .map(|var| graph.variable_name(*var).to_string())
          .collect(),
        run_id,
        cancel.clone(),
      ),
      inputs,
      launched: Launched {
        stage,
        fingerprint: freshness.fingerprint,
        consumed,
      },
      reason,
    }
  }

  fn fail_before_launch(&mut self, stage: StageId, cause: String) -> Prepared {
    self.tracker.record_failure(stage);
    let name = self.graph.stage_name(stage).to_string();
    Prepared::Done {
      report: self.report(
        stage,
        StageOutcome::Failed(StageError {
          stage: name.clone(),
          cause,
        }),
      ),
      settled: Settled::Failed { root: name },
    }
  }

  /// Record the result of a compute callback.
  pub(crate) fn finish(
    &mut self,
    launched: Launched,
    result: Result<VariableMap, StageFailure>,
    run_id: &str,
  ) -> (StageReport, Settled) {
    let Launched {
      stage,
      fingerprint,
      consumed,
    } = launched;
    let graph = Arc::clone(&self.graph);
    let name = graph.stage_name(stage).to_string();

    let outputs = match result {
      Ok(outputs) => outputs,
      Err(StageFailure::Cancelled) => {
        return (self.cancelled_report(stage), Settled::Cancelled);
      }
      Err(StageFailure::Failed(cause)) => {
        self.tracker.record_failure(stage);
        let report = self.report(
          stage,
          StageOutcome::Failed(StageError {
            stage: name.clone(),
            cause,
          }),
        );
        return (report, Settled::Failed { root: name });
      }
    };

    if let Some(missing) = graph
      .outputs(stage)
      .iter()
      .map(|var| graph.variable_name(*var))
      .find(|var| !outputs.contains_key(*var))
    {
      self.tracker.record_failure(stage);
      let report = self.report(
        stage,
        StageOutcome::Failed(StageError {
          stage: name.clone(),
          cause: format!("missing declared output '{}'", missing),
        }),
      );
      return (report, Settled::Failed { root: name });
    }

    let logic_version = graph.stage(stage).logic_version.clone();
    let provenance = Provenance {
      producer: name,
      input_fingerprint: fingerprint,
      logic_version: logic_version.clone(),
      run_id: run_id.to_string(),
      inputs: consumed,
    };
    self.store.replace(stage, outputs, &provenance);
    self.tracker.record_success(stage, fingerprint, &logic_version);

    (self.report(stage, StageOutcome::RanOk), Settled::Available)
  }

  pub(crate) fn report(&self, stage: StageId, outcome: StageOutcome) -> StageReport {
    let outputs = match outcome {
      StageOutcome::RanOk | StageOutcome::SkippedClean | StageOutcome::NotSelected => self
        .store
        .outputs(stage)
        .iter()
        .map(|(name, stored)| VariableRef {
          name: name.clone(),
          fingerprint: stored.fingerprint,
        })
        .collect(),
      _ => Vec::new(),
    };
    StageReport {
      stage: self.graph.stage_name(stage).to_string(),
      kind: self.graph.stage(stage).kind,
      outcome,
      outputs,
    }
  }

  pub(crate) fn cancelled_report(&self, stage: StageId) -> StageReport {
    self.report(stage, StageOutcome::Cancelled)
  }

  pub(crate) fn begin(&self, run_id: &str) {
    info!(run_id = %run_id, stages = self.graph.len(), "run_started");
    self.notifier.notify(RunEvent::RunStarted {
      run_id: run_id.to_string(),
      stages: self.graph.len(),
    });
  }

  pub(crate) fn started(&self, run_id: &str, stage: StageId, reason: DirtyReason) {
    let name = self.graph.stage_name(stage);
    info!(run_id = %run_id, stage = %name, reason = ?reason, "stage_started");
    self.notifier.notify(RunEvent::StageStarted {
      run_id: run_id.to_string(),
      stage: name.to_string(),
    });
  }

  /// Log a stage outcome and forward it to the notifier.
  pub(crate) fn announce(&self, run_id: &str, report: &StageReport) {
    let run_id = run_id.to_string();
    let stage = report.stage.clone();
    let event = match &report.outcome {
      StageOutcome::RanOk => {
        info!(run_id = %run_id, stage = %stage, outputs = report.outputs.len(), "stage_completed");
        RunEvent::StageCompleted {
          run_id,
          stage,
          outputs: report.outputs.clone(),
        }
      }
      StageOutcome::SkippedClean => {
        info!(run_id = %run_id, stage = %stage, "stage_skipped");
        RunEvent::StageSkipped { run_id, stage }
      }
      StageOutcome::Failed(e) => {
        error!(run_id = %run_id, stage = %stage, error = %e.cause, "stage_failed");
        RunEvent::StageFailed {
          run_id,
          stage,
          error: e.cause.clone(),
        }
      }
      StageOutcome::Blocked(e) => {
        warn!(run_id = %run_id, stage = %stage, blocked_by = %e.blocked_by, "stage_blocked");
        RunEvent::StageBlocked {
          run_id,
          stage,
          blocked_by: e.blocked_by.clone(),
        }
      }
      StageOutcome::Cancelled => {
        warn!(run_id = %run_id, stage = %stage, "stage_cancelled");
        RunEvent::StageCancelled { run_id, stage }
      }
      StageOutcome::NotSelected => {
        debug!(run_id = %run_id, stage = %stage, "stage_not_selected");
        RunEvent::StageNotSelected { run_id, stage }
      }
    };
    self.notifier.notify(event);
  }

  pub(crate) fn end(&self, report: &RunReport) {
    let success = report.is_success();
    info!(
      run_id = %report.run_id,
      success,
      ran = report.stages_where(|o| matches!(o, StageOutcome::RanOk)).len(),
      skipped = report.stages_where(|o| matches!(o, StageOutcome::SkippedClean)).len(),
      "run_completed"
    );
    self.notifier.notify(RunEvent::RunCompleted {
      run_id: report.run_id.clone(),
      success,
    });
  }
}
