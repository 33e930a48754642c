use thiserror::Error;

/// Structural errors raised while building a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("edge '{variable}' ({from} -> {to}) references unknown stage '{stage}'")]
  UnknownStageReference {
    stage: String,
    variable: String,
    from: String,
    to: String,
  },

  #[error("duplicate stage identifier: {stage}")]
  DuplicateStageIdentifier { stage: String },

  #[error("edge '{variable}' on stage '{stage}' is a self-loop")]
  SelfLoop { stage: String, variable: String },

  #[error(
    "stage '{stage}' receives variable '{variable}' from both '{first}' and '{second}'"
  )]
  ConflictingInput {
    stage: String,
    variable: String,
    first: String,
    second: String,
  },
}

/// A dependency cycle found while ordering the graph.
///
/// `path` follows edge direction: each stage feeds the next, and the last
/// stage feeds the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected: {}", render_cycle(.path))]
pub struct CycleError {
  pub path: Vec<String>,
}

fn render_cycle(path: &[String]) -> String {
  let mut rendered = path.join(" -> ");
  if let Some(first) = path.first() {
    rendered.push_str(" -> ");
    rendered.push_str(first);
  }
  rendered
}
