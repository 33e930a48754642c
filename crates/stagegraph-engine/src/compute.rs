//! The compute callback boundary.
//!
//! The engine never performs a stage's work itself. It hands each dirty stage
//! to a [`StageCompute`] implementation together with its input values and
//! stores whatever comes back.

use std::collections::BTreeMap;

use stagegraph_config::ParamValue;
use stagegraph_graph::{Stage, StageKind};
use tokio_util::sync::CancellationToken;

/// Variable name -> value mapping passed into and out of a compute callback.
pub type VariableMap = BTreeMap<String, serde_json::Value>;

/// Everything a compute callback knows about the stage it is running.
#[derive(Debug, Clone)]
pub struct StageContext {
  /// Stage identifier.
  pub stage: String,
  /// Role of the stage, for dispatching to loader/processor/plot logic.
  pub kind: StageKind,
  /// Declared parameters.
  pub params: BTreeMap<String, ParamValue>,
  /// Names of the variables the stage is expected to produce.
  pub outputs: Vec<String>,
  pub logic_version: String,
  pub run_id: String,
  /// Cancelled when the run is being torn down. Long-running callbacks should
  /// poll it and return [`StageFailure::Cancelled`].
  pub cancel: CancellationToken,
}

impl StageContext {
  pub(crate) fn new(
    stage: &Stage,
    outputs: Vec<String>,
    run_id: &str,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      stage: stage.name.clone(),
      kind: stage.kind,
      params: stage.params.clone(),
      outputs,
      logic_version: stage.logic_version.clone(),
      run_id: run_id.to_string(),
      cancel,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }
}

/// Failure signal returned by a compute callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageFailure {
  /// The stage could not produce its outputs.
  #[error("{0}")]
  Failed(String),

  /// The callback observed cancellation and stopped.
  #[error("cancelled")]
  Cancelled,
}

impl StageFailure {
  pub fn failed(cause: impl Into<String>) -> Self {
    Self::Failed(cause.into())
  }
}

/// External stage implementation.
///
/// May block; the concurrent coordinator runs callbacks on the blocking pool.
/// Retry policy, if any, belongs here: the engine never retries.
pub trait StageCompute: Send + Sync {
  fn compute(&self, ctx: &StageContext, inputs: &VariableMap) -> Result<VariableMap, StageFailure>;
}

impl<F> StageCompute for F
where
  F: Fn(&StageContext, &VariableMap) -> Result<VariableMap, StageFailure> + Send + Sync,
{
  fn compute(&self, ctx: &StageContext, inputs: &VariableMap) -> Result<VariableMap, StageFailure> {
    self(ctx, inputs)
  }
}
