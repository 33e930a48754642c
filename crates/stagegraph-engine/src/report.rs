//! Run reports.

use serde::Serialize;
use stagegraph_graph::StageKind;

use crate::error::{BlockedError, StageError};
use crate::fingerprint::Fingerprint;

/// Reference to a produced value, without the value itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableRef {
  pub name: String,
  pub fingerprint: Fingerprint,
}

/// What happened to a stage during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum StageOutcome {
  /// The stage was dirty and its compute callback succeeded.
  RanOk,
  /// The stage was clean; cached outputs were reused.
  SkippedClean,
  /// The compute callback failed.
  Failed(StageError),
  /// Not run because an ancestor failed.
  Blocked(BlockedError),
  /// Not started (or stopped cooperatively) because the run was cancelled.
  Cancelled,
  /// Outside the stages the run was restricted to; cached outputs untouched.
  NotSelected,
}

/// Fate of one stage in a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
  pub stage: String,
  pub kind: StageKind,
  #[serde(flatten)]
  pub outcome: StageOutcome,
  /// Outputs available after the run (fresh or reused).
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub outputs: Vec<VariableRef>,
}

/// Complete account of a run: one entry per stage, in topological order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
  pub run_id: String,
  pub entries: Vec<StageReport>,
}

impl RunReport {
  /// Outcome for a stage by identifier.
  pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
    self
      .entries
      .iter()
      .find(|entry| entry.stage == stage)
      .map(|entry| &entry.outcome)
  }

  /// Identifiers of stages whose outcome matches `predicate`, in report order.
  pub fn stages_where(&self, predicate: impl Fn(&StageOutcome) -> bool) -> Vec<&str> {
    self
      .entries
      .iter()
      .filter(|entry| predicate(&entry.outcome))
      .map(|entry| entry.stage.as_str())
      .collect()
  }

  /// True when no stage failed, was blocked, or was cancelled.
  pub fn is_success(&self) -> bool {
    self.entries.iter().all(|entry| {
      matches!(
        entry.outcome,
        StageOutcome::RanOk | StageOutcome::SkippedClean | StageOutcome::NotSelected
      )
    })
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn entry(stage: &str, outcome: StageOutcome) -> StageReport {
    StageReport {
      stage: stage.to_string(),
      kind: StageKind::Processor,
      outcome,
      outputs: Vec::new(),
    }
  }

  #[test]
  fn test_queries() {
    let report = RunReport {
      run_id: "r".to_string(),
      entries: vec![
        entry("a", StageOutcome::RanOk),
        entry("b", StageOutcome::SkippedClean),
        entry("c", StageOutcome::RanOk),
        entry("d", StageOutcome::NotSelected),
      ],
    };
    assert_eq!(report.outcome("b"), Some(&StageOutcome::SkippedClean));
    assert_eq!(report.outcome("zz"), None);
    assert_eq!(
      report.stages_where(|o| matches!(o, StageOutcome::RanOk)),
      vec!["a", "c"]
    );
    assert!(report.is_success());
  }

  #[test]
  fn test_serialized_shape() {
    let blocked = entry(
      "c",
      StageOutcome::Blocked(BlockedError {
        stage: "c".to_string(),
        blocked_by: "b".to_string(),
      }),
    );
    assert_eq!(
      serde_json::to_value(&blocked).unwrap(),
      json!({
        "stage": "c",
        "kind": "processor",
        "outcome": "blocked",
        "error": { "stage": "c", "blocked_by": "b" }
      })
    );
    assert_eq!(
      serde_json::to_value(entry("a", StageOutcome::SkippedClean)).unwrap(),
      json!({ "stage": "a", "kind": "processor", "outcome": "skipped_clean" })
    );
    assert_eq!(
      serde_json::to_value(entry("d", StageOutcome::NotSelected)).unwrap(),
      json!({ "stage": "d", "kind": "processor", "outcome": "not_selected" })
    );
  }
}
