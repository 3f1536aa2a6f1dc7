pub mod graph;
pub mod manager;
pub mod registry;
pub mod run_log;
pub mod stages;

pub use graph::{DagExecutor, Edge, GraphDefinition, RequiredInput, StageSpec};
pub use manager::{RunDebugView, RunOutcome, RunRequest, RunSummary, WorkflowManager};
pub use registry::RunRegistry;
pub use run_log::RunLogger;
pub use stages::{RemoteStage, StageSet, UnconfiguredStage};
