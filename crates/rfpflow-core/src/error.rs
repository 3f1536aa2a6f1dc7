use thiserror::Error;

use crate::types::{DocumentId, StageName};

#[derive(Debug, Error)]
pub enum WorkflowError {
    // Run preconditions
    #[error("Precondition failed for document {document_id}: {reason}")]
    PreconditionFailed {
        document_id: DocumentId,
        reason: String,
    },

    // Collaborator errors
    #[error("Document source error: {0}")]
    DocumentSource(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // Graph errors
    #[error("Invalid workflow graph: {0}")]
    Graph(String),

    // Stage errors (reported as data, never propagated out of the executor)
    #[error("Stage {stage} failed: {message}")]
    StageExecution { stage: StageName, message: String },

    #[error("Stage timeout after {timeout_secs}s: {stage}")]
    StageTimeout { stage: StageName, timeout_secs: u64 },

    #[error("Run exceeded deadline ({0}s)")]
    RunDeadlineExceeded(u64),

    // Executor-internal faults
    #[error("Executor fault: {0}")]
    Executor(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Whether this error was raised before any stage ran.
    pub fn is_precondition(&self) -> bool {
        matches!(self, WorkflowError::PreconditionFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
