//! Engine error types.

use serde::Serialize;
use stagegraph_graph::{CycleError, GraphError};

/// Errors that abort a run before any stage executes.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
  /// Malformed declarations.
  #[error(transparent)]
  Graph(#[from] GraphError),

  /// The graph contains a dependency cycle.
  #[error(transparent)]
  Cycle(#[from] CycleError),

  /// A caller named a stage that is not in the graph.
  #[error("stage '{stage}' not found in graph")]
  StageNotFound { stage: String },

  /// A caller-supplied order is not a topological order of the graph.
  #[error("invalid execution order: {message}")]
  InvalidOrder { message: String },
}

/// A stage's compute callback failed. Contained to that stage's subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("stage '{stage}' failed: {cause}")]
pub struct StageError {
  pub stage: String,
  pub cause: String,
}

/// A stage was not run because an ancestor failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("stage '{stage}' blocked by failed stage '{blocked_by}'")]
pub struct BlockedError {
  pub stage: String,
  pub blocked_by: String,
}
