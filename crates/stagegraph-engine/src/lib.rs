//! Stagegraph Engine
//!
//! Incremental execution over a [`DependencyGraph`]: decides which stages are
//! stale, runs only those, and records where every value came from.
//!
//! # Architecture
//!
//! ```text
//! Runtime
//! ├── run(compute)                       - sequential walk of the topological order
//! ├── run_from(stage, compute)           - only a stage and its descendants
//! ├── run_concurrent(compute, cancel)    - partial-order scheduling, bounded parallelism
//! ├── invalidate(stage)                  - external "source changed" signal
//! └── rebuild(graph)                     - swap in a rebuilt graph, keeping clean state
//!
//! ProvenanceTracker  - per-stage status, recorded input fingerprint, logic version
//! VariableStore      - per-stage output values with fingerprints and provenance
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stagegraph_engine::{Runtime, RuntimeConfig, StageFailure, VariableMap};
//!
//! let mut runtime = Runtime::from_project(&project, RuntimeConfig::default())?;
//!
//! let compute = |ctx: &StageContext, inputs: &VariableMap| -> Result<VariableMap, StageFailure> {
//!     dispatch(ctx.kind, &ctx.stage, inputs)
//! };
//!
//! let report = runtime.run(&compute)?;
//! runtime.invalidate("load_trials")?;
//! let report = runtime.run(&compute)?;
//! ```
//!
//! [`DependencyGraph`]: stagegraph_graph::DependencyGraph

mod compute;
mod concurrent;
mod error;
mod events;
mod fingerprint;
mod provenance;
mod report;
mod runtime;
mod store;

pub use compute::{StageCompute, StageContext, StageFailure, VariableMap};
pub use error::{BlockedError, RuntimeError, StageError};
pub use events::{ChannelNotifier, NoopNotifier, RunEvent, RunNotifier};
pub use fingerprint::Fingerprint;
pub use provenance::{DirtyReason, Freshness, ProvenanceTracker, StageStatus};
pub use report::{RunReport, StageOutcome, StageReport, VariableRef};
pub use runtime::{RunOptions, Runtime, RuntimeConfig};
pub use store::{ConsumedInput, Provenance, StoredVariable, VariableStore};
