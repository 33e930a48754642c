//! Stagegraph Config
//!
//! This crate contains the serializable project declaration types for stagegraph.
//! These types describe an analysis project's stages and the named variables
//! flowing between them, before the graph is built and validated.
//!
//! Declarations can be loaded from:
//! - JSON project files (via CLI with `stagegraph run project.json`)
//! - Any other collaborator that can produce the same shape
//!
//! Layout fields (`x`, `y`) that a rendering collaborator stores alongside
//! stages are accepted and dropped.

mod edge;
mod error;
mod project;
mod stage;

pub use edge::EdgeDef;
pub use error::ConfigError;
pub use project::ProjectDef;
pub use stage::{DEFAULT_LOGIC_VERSION, ParamValue, StageDef};
