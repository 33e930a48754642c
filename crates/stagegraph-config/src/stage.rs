use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logic version assumed when a stage declaration does not carry one.
pub const DEFAULT_LOGIC_VERSION: &str = "0";

/// A declared parameter value. Opaque to the engine apart from fingerprinting.
pub type ParamValue = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
  /// Stage identifier, unique within a project.
  pub id: String,

  /// Declared parameters (constants) for the stage.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub params: BTreeMap<String, ParamValue>,

  /// Version of the stage's logic. Bumping it forces a re-run.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
}

impl StageDef {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      params: BTreeMap::new(),
      version: None,
    }
  }

  pub fn with_param(mut self, key: impl Into<String>, value: ParamValue) -> Self {
    self.params.insert(key.into(), value);
    self
  }

  pub fn with_version(mut self, version: impl Into<String>) -> Self {
    self.version = Some(version.into());
    self
  }

  /// The declared logic version, or [`DEFAULT_LOGIC_VERSION`].
  pub fn logic_version(&self) -> &str {
    self.version.as_deref().unwrap_or(DEFAULT_LOGIC_VERSION)
  }
}
