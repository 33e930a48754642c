use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use stagegraph_config::{EdgeDef, ParamValue, ProjectDef, StageDef};
use tracing::debug;

use crate::error::GraphError;
use crate::registry::{Registry, StageId, VarName, VariableKey};

/// Role of a stage, inferred from its position in the graph.
///
/// Only compute dispatch cares about this; ordering and staleness do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
  /// No inbound edges.
  Loader,
  /// Inbound and outbound edges.
  Processor,
  /// Inbound edges only.
  Plot,
}

/// A processing unit in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
  pub id: StageId,
  pub name: String,
  pub kind: StageKind,
  pub params: BTreeMap<String, ParamValue>,
  pub logic_version: String,
}

/// A directed `(producer, consumer, variable)` relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
  pub producer: StageId,
  pub consumer: StageId,
  pub variable: VarName,
}

impl Edge {
  pub fn key(&self) -> VariableKey {
    VariableKey::new(self.producer, self.variable)
  }
}

/// Immutable dependency graph.
///
/// All per-stage tables are indexed by [`StageId`].
#[derive(Debug, Clone)]
pub struct DependencyGraph {
  registry: Registry,
  stages: Vec<Stage>,
  edges: Vec<Edge>,
  /// stage -> stages it feeds, in edge declaration order, deduplicated.
  forward: Vec<Vec<StageId>>,
  /// stage -> stages it depends on, in edge declaration order, deduplicated.
  backward: Vec<Vec<StageId>>,
  /// stage -> variables it consumes.
  inputs: Vec<Vec<VariableKey>>,
  /// stage -> variable names it produces for at least one consumer.
  outputs: Vec<Vec<VarName>>,
}

impl DependencyGraph {
  /// Build a graph from stage and edge declarations.
  ///
  /// Validates structure only. Cycles are left for [`crate::order`].
  pub fn build(stage_defs: &[StageDef], edge_defs: &[EdgeDef]) -> Result<Self, GraphError> {
    let mut registry = Registry::new();
    for def in stage_defs {
      registry.register_stage(&def.id)?;
    }

    let count = stage_defs.len();
    let mut edges = Vec::with_capacity(edge_defs.len());
    let mut forward: Vec<Vec<StageId>> = vec![Vec::new(); count];
    let mut backward: Vec<Vec<StageId>> = vec![Vec::new(); count];
    let mut inputs: Vec<Vec<VariableKey>> = vec![Vec::new(); count];
    let mut outputs: Vec<Vec<VarName>> = vec![Vec::new(); count];

    let mut seen: HashSet<Edge> = HashSet::new();
    // consumer -> variable name -> producer
    let mut input_sources: Vec<HashMap<VarName, StageId>> = vec![HashMap::new(); count];

    for def in edge_defs {
      let resolve = |id: &str| {
        registry
          .stage_id(id)
          .ok_or_else(|| GraphError::UnknownStageReference {
            stage: id.to_string(),
            variable: def.variable_name.clone(),
            from: def.from.clone(),
            to: def.to.clone(),
          })
      };
      let producer = resolve(&def.from)?;
      let consumer = resolve(&def.to)?;

      if producer == consumer {
        return Err(GraphError::SelfLoop {
          stage: def.from.clone(),
          variable: def.variable_name.clone(),
        });
      }

      let variable = registry.intern_variable(&def.variable_name);
      let edge = Edge {
        producer,
        consumer,
        variable,
      };
      if !seen.insert(edge) {
        debug!(
          variable = %def.variable_name,
          from = %def.from,
          to = %def.to,
          "ignoring duplicate edge"
        );
        continue;
      }

      if let Some(&first) = input_sources[consumer.index()].get(&variable) {
        return Err(GraphError::ConflictingInput {
          stage: def.to.clone(),
          variable: def.variable_name.clone(),
          first: registry.stage_name(first).to_string(),
          second: def.from.clone(),
        });
      }
      input_sources[consumer.index()].insert(variable, producer);

      if !forward[producer.index()].contains(&consumer) {
        forward[producer.index()].push(consumer);
        backward[consumer.index()].push(producer);
      }
      inputs[consumer.index()].push(edge.key());
      if !outputs[producer.index()].contains(&variable) {
        outputs[producer.index()].push(variable);
      }
      edges.push(edge);
    }

    let stages = stage_defs
      .iter()
      .enumerate()
      .map(|(index, def)| {
        let kind = if backward[index].is_empty() {
          StageKind::Loader
        } else if forward[index].is_empty() {
          StageKind::Plot
        } else {
          StageKind::Processor
        };
        Stage {
          id: StageId::from_index(index),
          name: def.id.clone(),
          kind,
          params: def.params.clone(),
          logic_version: def.logic_version().to_string(),
        }
      })
      .collect();

    debug!(
      stages = count,
      edges = edges.len(),
      variables = registry.variable_count(),
      "dependency graph built"
    );

    Ok(Self {
      registry,
      stages,
      edges,
      forward,
      backward,
      inputs,
      outputs,
    })
  }

  /// Build a graph from a whole project declaration.
  pub fn from_project(project: &ProjectDef) -> Result<Self, GraphError> {
    Self::build(&project.stages, &project.edges)
  }

  pub fn len(&self) -> usize {
    self.stages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.stages.is_empty()
  }

  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  pub fn stages(&self) -> &[Stage] {
    &self.stages
  }

  /// Stage ids in declaration order.
  pub fn stage_ids(&self) -> impl Iterator<Item = StageId> + '_ {
    self.stages.iter().map(|stage| stage.id)
  }

  pub fn stage(&self, stage: StageId) -> &Stage {
    &self.stages[stage.index()]
  }

  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  /// Find a stage by its declared identifier.
  pub fn lookup(&self, id: &str) -> Option<StageId> {
    self.registry.stage_id(id)
  }

  pub fn stage_name(&self, stage: StageId) -> &str {
    self.registry.stage_name(stage)
  }

  pub fn variable_name(&self, var: VarName) -> &str {
    self.registry.variable_name(var)
  }

  /// Stages fed by `stage`.
  pub fn downstream(&self, stage: StageId) -> &[StageId] {
    &self.forward[stage.index()]
  }

  /// Stages `stage` depends on.
  pub fn upstream(&self, stage: StageId) -> &[StageId] {
    &self.backward[stage.index()]
  }

  /// Variables consumed by `stage`.
  pub fn inputs(&self, stage: StageId) -> &[VariableKey] {
    &self.inputs[stage.index()]
  }

  /// Variable names `stage` must produce for its consumers.
  pub fn outputs(&self, stage: StageId) -> &[VarName] {
    &self.outputs[stage.index()]
  }

  /// All stages `stage` transitively depends on, in declaration order.
  pub fn ancestors(&self, stage: StageId) -> Vec<StageId> {
    self.reachable(stage, &self.backward)
  }

  /// All stages transitively fed by `stage`, in declaration order.
  pub fn descendants(&self, stage: StageId) -> Vec<StageId> {
    self.reachable(stage, &self.forward)
  }

  /// The stage itself, its direct predecessors and its direct successors.
  pub fn neighborhood(&self, stage: StageId) -> Vec<StageId> {
    let mut nodes = vec![stage];
    nodes.extend_from_slice(self.upstream(stage));
    nodes.extend_from_slice(self.downstream(stage));
    nodes
  }

  fn reachable(&self, start: StageId, adjacency: &[Vec<StageId>]) -> Vec<StageId> {
    let mut visited = vec![false; self.len()];
    let mut work: Vec<StageId> = adjacency[start.index()].clone();
    while let Some(stage) = work.pop() {
      if visited[stage.index()] {
        continue;
      }
      visited[stage.index()] = true;
      work.extend(
        adjacency[stage.index()]
          .iter()
          .filter(|next| !visited[next.index()]),
      );
    }
    // A cycle through `start` would otherwise list it as its own relative.
    visited[start.index()] = false;

    visited
      .iter()
      .enumerate()
      .filter(|(_, reached)| **reached)
      .map(|(index, _)| StageId::from_index(index))
      .collect()
  }
}
