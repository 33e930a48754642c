//! Cached variable values and their provenance.

use std::collections::BTreeMap;

use serde::Serialize;
use stagegraph_graph::{DependencyGraph, StageId, VariableKey};

use crate::compute::VariableMap;
use crate::fingerprint::Fingerprint;

/// One upstream variable a run consumed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumedInput {
  pub producer: String,
  pub name: String,
  /// Fingerprint of the value as it was read.
  pub fingerprint: Fingerprint,
  /// Run that produced the value that was read.
  pub run_id: String,
}

/// Where a stored value came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
  /// Identifier of the producing stage.
  pub producer: String,
  /// Input fingerprint of the producing run.
  pub input_fingerprint: Fingerprint,
  /// Logic version of the producing run.
  pub logic_version: String,
  /// Run that produced the value.
  pub run_id: String,
  /// Upstream variables the producing run read, in edge declaration order.
  pub inputs: Vec<ConsumedInput>,
}

/// A materialized variable instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredVariable {
  pub value: serde_json::Value,
  pub fingerprint: Fingerprint,
  pub provenance: Provenance,
}

/// Output values per stage, indexed by [`StageId`].
///
/// Outputs are keyed by name within their producer, so the same label used by
/// two producers names two independent values.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
  outputs: Vec<BTreeMap<String, StoredVariable>>,
}

impl VariableStore {
  pub fn new(graph: &DependencyGraph) -> Self {
    Self {
      outputs: vec![BTreeMap::new(); graph.len()],
    }
  }

  /// Keep outputs of stages that survive a rebuild, matched by identifier.
  pub fn carry_over(
    old_graph: &DependencyGraph,
    mut old: VariableStore,
    new_graph: &DependencyGraph,
  ) -> Self {
    let outputs = new_graph
      .stages()
      .iter()
      .map(|stage| {
        old_graph
          .lookup(&stage.name)
          .and_then(|previous| old.outputs.get_mut(previous.index()))
          .map(std::mem::take)
          .unwrap_or_default()
      })
      .collect();
    Self { outputs }
  }

  /// Look up a variable by producer and name.
  pub fn get(&self, producer: StageId, name: &str) -> Option<&StoredVariable> {
    self.outputs.get(producer.index())?.get(name)
  }

  /// Look up the variable an edge refers to.
  pub fn resolve(&self, graph: &DependencyGraph, key: VariableKey) -> Option<&StoredVariable> {
    self.get(key.producer, graph.variable_name(key.name))
  }

  /// All outputs currently stored for a stage.
  pub fn outputs(&self, stage: StageId) -> &BTreeMap<String, StoredVariable> {
    &self.outputs[stage.index()]
  }

  /// Replace a stage's outputs with the values of a new run.
  pub fn replace(&mut self, stage: StageId, values: VariableMap, provenance: &Provenance) {
    let stored = values
      .into_iter()
      .map(|(name, value)| {
        let fingerprint = Fingerprint::of_value(&value);
        let variable = StoredVariable {
          value,
          fingerprint,
          provenance: provenance.clone(),
        };
        (name, variable)
      })
      .collect();
    self.outputs[stage.index()] = stored;
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use stagegraph_config::{EdgeDef, StageDef};

  use super::*;

  fn provenance(producer: &str) -> Provenance {
    Provenance {
      producer: producer.to_string(),
      input_fingerprint: Fingerprint::of_bytes(b"inputs"),
      logic_version: "0".to_string(),
      run_id: "run-1".to_string(),
      inputs: Vec::new(),
    }
  }

  #[test]
  fn test_same_label_from_two_producers() {
    let graph = DependencyGraph::build(
      &[StageDef::new("a"), StageDef::new("b")],
      &[],
    )
    .unwrap();
    let a = graph.lookup("a").unwrap();
    let b = graph.lookup("b").unwrap();

    let mut store = VariableStore::new(&graph);
    store.replace(a, VariableMap::from([("v".to_string(), json!(1))]), &provenance("a"));
    store.replace(b, VariableMap::from([("v".to_string(), json!(2))]), &provenance("b"));

    assert_eq!(store.get(a, "v").unwrap().value, json!(1));
    assert_eq!(store.get(b, "v").unwrap().value, json!(2));
    assert_eq!(store.get(b, "v").unwrap().provenance.producer, "b");
  }

  #[test]
  fn test_replace_drops_previous_outputs() {
    let graph = DependencyGraph::build(&[StageDef::new("a")], &[]).unwrap();
    let a = graph.lookup("a").unwrap();

    let mut store = VariableStore::new(&graph);
    store.replace(a, VariableMap::from([("old".to_string(), json!(1))]), &provenance("a"));
    store.replace(a, VariableMap::from([("new".to_string(), json!(2))]), &provenance("a"));

    assert!(store.get(a, "old").is_none());
    assert_eq!(store.outputs(a).len(), 1);
  }

  #[test]
  fn test_carry_over_matches_by_identifier() {
    let old_graph = DependencyGraph::build(
      &[StageDef::new("a"), StageDef::new("b")],
      &[EdgeDef::new("v", "a", "b")],
    )
    .unwrap();
    let mut old = VariableStore::new(&old_graph);
    let a = old_graph.lookup("a").unwrap();
    old.replace(a, VariableMap::from([("v".to_string(), json!("kept"))]), &provenance("a"));

    // "a" moves to a different index in the rebuilt graph.
    let new_graph = DependencyGraph::build(
      &[StageDef::new("c"), StageDef::new("b"), StageDef::new("a")],
      &[EdgeDef::new("v", "a", "b")],
    )
    .unwrap();
    let store = VariableStore::carry_over(&old_graph, old, &new_graph);

    let new_a = new_graph.lookup("a").unwrap();
    assert_eq!(store.get(new_a, "v").unwrap().value, json!("kept"));
    assert!(store.outputs(new_graph.lookup("c").unwrap()).is_empty());
  }
}
