pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, WorkflowError};
pub use event::EventBus;
pub use state::{DefaultMergePolicy, MergePolicy, PartialUpdate, StageInput, StageOutcome, WorkflowState};
pub use types::*;
