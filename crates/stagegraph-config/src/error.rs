use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading project declarations.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read project file {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse project declarations: {0}")]
  Parse(#[from] serde_json::Error),
}
