//! Stagegraph Graph
//!
//! This crate turns flat project declarations into a validated, immutable
//! dependency graph and computes execution orders over it.
//!
//! Key differences from `stagegraph-config`:
//! - Stage identifiers are unique and interned to dense [`StageId`] indices
//! - Every edge references declared stages and is not a self-loop
//! - Forward/backward adjacency and per-stage inputs/outputs are precomputed
//! - Stage kinds are inferred from their role in the graph
//!
//! Acyclicity is not checked at build time; [`order`] reports cycles.

mod error;
mod graph;
mod order;
mod registry;

pub use error::{CycleError, GraphError};
pub use graph::{DependencyGraph, Edge, Stage, StageKind};
pub use order::order;
pub use registry::{Registry, StageId, VarName, VariableKey};
