//! Interning for stage identifiers and variable names.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Dense index of a stage, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(u32);

impl StageId {
  pub fn index(self) -> usize {
    self.0 as usize
  }

  pub(crate) fn from_index(index: usize) -> Self {
    Self(index as u32)
  }
}

impl fmt::Display for StageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Interned variable name. Not unique per datum: see [`VariableKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarName(u32);

/// Identity of a variable instance: a name scoped to its producing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableKey {
  pub producer: StageId,
  pub name: VarName,
}

impl VariableKey {
  pub fn new(producer: StageId, name: VarName) -> Self {
    Self { producer, name }
  }
}

/// Lookup tables shared by every component that needs to go between
/// identifiers and indices.
#[derive(Debug, Clone, Default)]
pub struct Registry {
  stage_names: Vec<String>,
  stage_lookup: HashMap<String, StageId>,
  var_names: Vec<String>,
  var_lookup: HashMap<String, VarName>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a stage identifier. Identifiers must be unique.
  pub fn register_stage(&mut self, id: &str) -> Result<StageId, GraphError> {
    if self.stage_lookup.contains_key(id) {
      return Err(GraphError::DuplicateStageIdentifier {
        stage: id.to_string(),
      });
    }
    let stage = StageId::from_index(self.stage_names.len());
    self.stage_names.push(id.to_string());
    self.stage_lookup.insert(id.to_string(), stage);
    Ok(stage)
  }

  /// Intern a variable name. Repeated names resolve to the same symbol.
  pub fn intern_variable(&mut self, name: &str) -> VarName {
    if let Some(&var) = self.var_lookup.get(name) {
      return var;
    }
    let var = VarName(self.var_names.len() as u32);
    self.var_names.push(name.to_string());
    self.var_lookup.insert(name.to_string(), var);
    var
  }

  pub fn stage_id(&self, id: &str) -> Option<StageId> {
    self.stage_lookup.get(id).copied()
  }

  pub fn stage_name(&self, stage: StageId) -> &str {
    &self.stage_names[stage.index()]
  }

  pub fn variable(&self, name: &str) -> Option<VarName> {
    self.var_lookup.get(name).copied()
  }

  pub fn variable_name(&self, var: VarName) -> &str {
    &self.var_names[var.0 as usize]
  }

  pub fn stage_count(&self) -> usize {
    self.stage_names.len()
  }

  pub fn variable_count(&self) -> usize {
    self.var_names.len()
  }
}
