//! Graph Execution Engine: DAG-based stage orchestration.
//!
//! A workflow is a validated acyclic graph of `StageSpec`s. Dependencies are
//! the only edges: a stage becomes ready once every upstream stage is
//! terminal, and independent stages run concurrently.
//!
//! The `DagExecutor` owns the state record for the length of a run, hands
//! each stage a snapshot, and merges results back one at a time.

pub mod definition;
pub mod executor;
pub mod stage;

pub use definition::{Edge, GraphDefinition};
pub use executor::DagExecutor;
pub use stage::{RequiredInput, StageSpec};
