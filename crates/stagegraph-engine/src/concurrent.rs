//! Concurrent coordinator.
//!
//! Stages become ready once every upstream stage has settled. Ready stages are
//! launched in topological-order position, at most `max_concurrency` at a time,
//! on the blocking pool. The resulting report has the same shape as a
//! sequential run. A callback that panics fails its own stage only.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use stagegraph_graph::{DependencyGraph, StageId, order};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::compute::{StageCompute, StageFailure, VariableMap};
use crate::error::RuntimeError;
use crate::report::{RunReport, StageOutcome, StageReport};
use crate::runtime::{Launched, Prepared, RunOptions, Runtime, Settled};

impl Runtime {
  /// Run every stage that needs it, independent stages in parallel.
  ///
  /// Once `cancel` fires (or a callback reports cancellation) no new stage is
  /// launched; in-flight callbacks finish and are recorded, everything not
  /// started is reported cancelled.
  pub async fn run_concurrent<C>(
    &mut self,
    compute: Arc<C>,
    cancel: CancellationToken,
  ) -> Result<RunReport, RuntimeError>
  where
    C: StageCompute + 'static,
  {
    self
      .run_concurrent_with_options(compute, &RunOptions::default(), cancel)
      .await
  }

  /// Concurrent run with an explicit selection and force flag.
  #[instrument(
    name = "runtime_run_concurrent",
    skip_all,
    fields(
      stages = self.graph.len(),
      max_concurrency = self.config.max_concurrency,
      force = options.force
    )
  )]
  pub async fn run_concurrent_with_options<C>(
    &mut self,
    compute: Arc<C>,
    options: &RunOptions,
    cancel: CancellationToken,
  ) -> Result<RunReport, RuntimeError>
  where
    C: StageCompute + 'static,
  {
    let graph = Arc::clone(&self.graph);
    let order = order(&graph)?;
    let selection = self.select(options)?;
    let max_in_flight = self.config.max_concurrency.max(1);

    let run_id = uuid::Uuid::new_v4().to_string();
    let run_cancel = cancel.child_token();
    self.begin(&run_id);

    let mut position = vec![0usize; graph.len()];
    for (i, stage) in order.iter().enumerate() {
      position[stage.index()] = i;
    }

    let mut pending: Vec<usize> = graph.stage_ids().map(|s| graph.upstream(s).len()).collect();
    let mut ready: BTreeSet<usize> = order
      .iter()
      .enumerate()
      .filter(|(_, stage)| pending[stage.index()] == 0)
      .map(|(i, _)| i)
      .collect();

    let mut settled: Vec<Option<Settled>> = vec![None; graph.len()];
    let mut reports: Vec<Option<StageReport>> = vec![None; order.len()];
    let mut in_flight: JoinSet<Result<VariableMap, StageFailure>> = JoinSet::new();
    let mut launched_tasks: HashMap<task::Id, Launched> = HashMap::new();

    loop {
      while !run_cancel.is_cancelled() && in_flight.len() < max_in_flight {
        let Some(pos) = ready.pop_first() else {
          break;
        };
        let stage = order[pos];

        match self.prepare(stage, &settled, &selection, &run_id, &run_cancel) {
          Prepared::Done {
            report,
            settled: outcome,
          } => {
            self.announce(&run_id, &report);
            settled[stage.index()] = Some(outcome);
            reports[pos] = Some(report);
            release(&graph, stage, &position, &mut pending, &mut ready);
          }
          Prepared::Launch {
            ctx,
            inputs,
            launched,
            reason,
          } => {
            self.started(&run_id, stage, reason);
            let compute = Arc::clone(&compute);
            let handle = in_flight.spawn_blocking(move || compute.compute(&ctx, &inputs));
            launched_tasks.insert(handle.id(), launched);
          }
        }
      }

      let Some(joined) = in_flight.join_next_with_id().await else {
        break;
      };
      let (id, result) = match joined {
        Ok((id, result)) => (id, result),
        Err(e) => {
          let cause = if e.is_panic() {
            "compute callback panicked".to_string()
          } else {
            e.to_string()
          };
          (e.id(), Err(StageFailure::failed(cause)))
        }
      };
      let Some(launched) = launched_tasks.remove(&id) else {
        error!(run_id = %run_id, task = %id, "joined a task with no launched stage");
        continue;
      };
      let stage = launched.stage;

      if matches!(result, Err(StageFailure::Cancelled)) && !run_cancel.is_cancelled() {
        warn!(run_id = %run_id, stage = %graph.stage_name(stage), "stage requested cancellation");
        run_cancel.cancel();
      }

      let (report, outcome) = self.finish(launched, result, &run_id);
      self.announce(&run_id, &report);
      settled[stage.index()] = Some(outcome);
      reports[position[stage.index()]] = Some(report);
      release(&graph, stage, &position, &mut pending, &mut ready);
    }

    let mut entries = Vec::with_capacity(order.len());
    for (pos, report) in reports.into_iter().enumerate() {
      let report = match report {
        Some(report) => report,
        None if selection.contains(order[pos]) => {
          let report = self.cancelled_report(order[pos]);
          self.announce(&run_id, &report);
          report
        }
        None => {
          let report = self.report(order[pos], StageOutcome::NotSelected);
          self.announce(&run_id, &report);
          report
        }
      };
      entries.push(report);
    }

    let report = RunReport { run_id, entries };
    self.end(&report);
    Ok(report)
  }
}

/// Count a settled stage against its consumers; queue those with nothing left
/// to wait on.
fn release(
  graph: &DependencyGraph,
  stage: StageId,
  position: &[usize],
  pending: &mut [usize],
  ready: &mut BTreeSet<usize>,
) {
  for next in graph.downstream(stage) {
    let remaining = &mut pending[next.index()];
    *remaining -= 1;
    if *remaining == 0 {
      ready.insert(position[next.index()]);
    }
  }
}
