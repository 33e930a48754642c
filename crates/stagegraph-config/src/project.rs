use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::edge::EdgeDef;
use crate::error::ConfigError;
use crate::stage::StageDef;

/// A project's declared stage/variable graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectDef {
  #[serde(default)]
  pub name: String,
  #[serde(default, alias = "nodes")]
  pub stages: Vec<StageDef>,
  #[serde(default)]
  pub edges: Vec<EdgeDef>,
}

impl ProjectDef {
  /// Parse declarations from a JSON document.
  pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(content)?)
  }

  /// Read and parse a JSON project file.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json_str(&content)
  }
}
