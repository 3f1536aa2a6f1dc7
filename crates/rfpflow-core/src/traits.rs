use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::state::{PartialUpdate, WorkflowState};
use crate::types::{DocumentId, InsightsRecord, ProjectId};

/// Stage adapter: one pipeline stage behind a uniform contract.
///
/// `execute` must not fail: any internal problem (network error, malformed
/// model output, missing credentials) is reported through
/// `PartialUpdate::error` with the output fields left empty.
pub trait StageAdapter: Send + Sync + 'static {
    /// Run the stage against a read-only snapshot of the record.
    fn execute(&self, state: Arc<WorkflowState>) -> BoxFuture<'_, PartialUpdate>;

    /// Per-stage timeout override in seconds (None = executor default).
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Document source: where extracted source text comes from.
pub trait DocumentSource: Send + Sync + 'static {
    /// Extracted text for a document, `None` when the document is unknown or
    /// has not been extracted yet.
    fn extracted_text(&self, document_id: DocumentId) -> BoxFuture<'_, Result<Option<String>>>;
}

/// Insights repository: durable copy of finished runs.
pub trait InsightsRepository: Send + Sync + 'static {
    /// Insert or replace the insights stored for `record.project_id`.
    fn upsert_insights(&self, record: InsightsRecord) -> BoxFuture<'_, Result<()>>;

    /// Load the stored insights for a project.
    fn load_insights(&self, project_id: ProjectId) -> BoxFuture<'_, Result<Option<InsightsRecord>>>;
}

/// Receives snapshots of a run's record while it executes.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, snapshot: &WorkflowState);
}
