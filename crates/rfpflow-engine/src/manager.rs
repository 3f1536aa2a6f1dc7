use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use rfpflow_core::config::AppConfig;
use rfpflow_core::error::{Result, WorkflowError};
use rfpflow_core::event::EventBus;
use rfpflow_core::state::WorkflowState;
use rfpflow_core::traits::{DocumentSource, InsightsRepository};
use rfpflow_core::types::{
    DocumentId, ExecutionLogEntry, ProjectId, RunId, RunStatus, StageName, StageStatus,
    TaskSelection, WorkflowEvent,
};

use crate::graph::{DagExecutor, GraphDefinition};
use crate::registry::RunRegistry;
use crate::stages::StageSet;

/// A request to analyze one document for one project.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub project_id: ProjectId,
    pub document_id: DocumentId,
    /// `{task: enabled}`; unknown keys produce warnings on the run.
    pub selected_tasks: HashMap<String, bool>,
    pub retrieved_context: Option<String>,
}

impl RunRequest {
    pub fn new(project_id: ProjectId, document_id: DocumentId) -> Self {
        Self {
            project_id,
            document_id,
            selected_tasks: HashMap::new(),
            retrieved_context: None,
        }
    }

    pub fn with_task(mut self, task: impl Into<String>, enabled: bool) -> Self {
        self.selected_tasks.insert(task.into(), enabled);
        self
    }

    pub fn with_selection(mut self, selected: HashMap<String, bool>) -> Self {
        self.selected_tasks = selected;
        self
    }

    pub fn with_retrieved_context(mut self, context: impl Into<String>) -> Self {
        self.retrieved_context = Some(context.into());
        self
    }
}

/// Counts reported for a finished run.
///
/// `proposal_created` is true whenever a draft exists, including the empty
/// draft a skipped proposal builder leaves behind. It is false only when the
/// builder failed, timed out or was abandoned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub rfp_summary: Option<String>,
    pub challenges_count: usize,
    pub value_propositions_count: usize,
    pub case_studies_count: usize,
    pub proposal_created: bool,
    pub errors_count: usize,
}

impl RunSummary {
    pub fn from_state(state: &WorkflowState) -> Self {
        Self {
            rfp_summary: state.summary.clone(),
            challenges_count: state.challenges.as_ref().map_or(0, Vec::len),
            value_propositions_count: state.value_propositions.as_ref().map_or(0, Vec::len),
            case_studies_count: state.matched_cases.as_ref().map_or(0, Vec::len),
            proposal_created: state.proposal_draft.is_some(),
            errors_count: state.errors.len(),
        }
    }
}

/// Result of a completed run.
///
/// `success` is true for every run that reached the end of the graph, even
/// when stages recorded errors. A failed durable save is reported separately
/// in `persistence_error` and does not change `success`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub success: bool,
    pub summary: RunSummary,
    pub state: Arc<WorkflowState>,
    pub persistence_error: Option<String>,
}

impl RunOutcome {
    pub fn is_durable(&self) -> bool {
        self.persistence_error.is_none()
    }
}

/// Inspection view of a run's record.
#[derive(Debug, Clone, Serialize)]
pub struct RunDebugView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_stage: Option<StageName>,
    pub stage_status: BTreeMap<StageName, StageStatus>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub execution_log: Vec<ExecutionLogEntry>,
    pub has_rfp_summary: bool,
    pub has_challenges: bool,
    pub has_discovery_questions: bool,
    pub has_value_propositions: bool,
    pub has_case_studies: bool,
    pub has_proposal: bool,
    pub full_state: WorkflowState,
}

impl RunDebugView {
    pub fn from_state(state: Arc<WorkflowState>) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            current_stage: state.current_stage,
            stage_status: state.stage_status.clone(),
            errors: state.errors.clone(),
            warnings: state.warnings.clone(),
            execution_log: state.execution_log.clone(),
            has_rfp_summary: state.summary.is_some(),
            has_challenges: state.challenges.is_some(),
            has_discovery_questions: state.discovery_questions.is_some(),
            has_value_propositions: state.value_propositions.is_some(),
            has_case_studies: state.matched_cases.is_some(),
            has_proposal: state.proposal_draft.is_some(),
            full_state: (*state).clone(),
        }
    }
}

/// Entry point for running the presales workflow.
///
/// Validates preconditions, registers the run before execution so it can be
/// polled, drives the executor, and hands the final record to the insights
/// repository.
pub struct WorkflowManager {
    executor: DagExecutor,
    documents: Arc<dyn DocumentSource>,
    repository: Arc<dyn InsightsRepository>,
    registry: Arc<RunRegistry>,
    event_bus: Arc<EventBus>,
    model_used: String,
}

impl WorkflowManager {
    pub fn new(
        executor: DagExecutor,
        documents: Arc<dyn DocumentSource>,
        repository: Arc<dyn InsightsRepository>,
        registry: Arc<RunRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            executor,
            documents,
            repository,
            registry,
            event_bus,
            model_used: "unspecified".to_string(),
        }
    }

    /// Wire the presales graph, registry and model label from config.
    pub fn from_config(
        config: &AppConfig,
        stages: StageSet,
        documents: Arc<dyn DocumentSource>,
        repository: Arc<dyn InsightsRepository>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        let executor = DagExecutor::new(GraphDefinition::presales()?, stages, event_bus.clone())?
            .with_config(&config.workflow);
        let registry = Arc::new(RunRegistry::from_config(&config.registry));
        Ok(Self::new(executor, documents, repository, registry, event_bus)
            .with_model_used(config.workflow.model_used.clone()))
    }

    pub fn with_model_used(mut self, model: impl Into<String>) -> Self {
        self.model_used = model.into();
        self
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run the workflow to completion.
    ///
    /// Returns `Err` only for a precondition failure (no run is created) or an
    /// executor-internal fault. Stage failures are reported inside the
    /// outcome's state.
    pub async fn run_workflow(&self, request: RunRequest) -> Result<RunOutcome> {
        let state = self.prepare(&request).await?;
        self.drive(state).await
    }

    /// Validate and register the run, then execute it on a spawned task.
    /// Poll with `get_run`.
    pub async fn start_run(self: &Arc<Self>, request: RunRequest) -> Result<RunId> {
        let state = self.prepare(&request).await?;
        let run_id = state.run_id.clone();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let run_id = state.run_id.clone();
            if let Err(e) = manager.drive(state).await {
                error!(run_id = %run_id, error = %e, "Background run failed");
            }
        });
        Ok(run_id)
    }

    /// Latest snapshot of a run, `None` if unknown or expired.
    pub fn get_run(&self, run_id: &RunId) -> Option<Arc<WorkflowState>> {
        self.registry.get(run_id)
    }

    pub fn latest_run_for_project(&self, project_id: ProjectId) -> Option<Arc<WorkflowState>> {
        self.registry.latest_for_project(project_id)
    }

    pub fn debug_view(&self, run_id: &RunId) -> Option<RunDebugView> {
        self.get_run(run_id).map(RunDebugView::from_state)
    }

    async fn prepare(&self, request: &RunRequest) -> Result<WorkflowState> {
        let text = self.documents.extracted_text(request.document_id).await?;
        let text = match text {
            Some(t) if !t.trim().is_empty() => t,
            Some(_) => {
                return Err(self.precondition(request, "document has no extracted text"));
            }
            None => {
                return Err(self.precondition(request, "document not found or not yet extracted"));
            }
        };

        let selection = TaskSelection::from_map(&request.selected_tasks);
        for warning in selection.warnings() {
            warn!(project_id = %request.project_id, "{}", warning);
        }

        let state = WorkflowState::new(
            RunId::new(request.project_id, request.document_id),
            request.project_id,
            request.document_id,
            text,
        )
        .with_retrieved_context(request.retrieved_context.clone())
        .with_selection(&selection);

        self.registry.register(&state);
        info!(
            run_id = %state.run_id,
            project_id = %state.project_id,
            document_id = %state.document_id,
            disabled = state.disabled_stages.len(),
            "Run registered"
        );
        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id: state.run_id.clone(),
            project_id: state.project_id,
        });
        Ok(state)
    }

    fn precondition(&self, request: &RunRequest, reason: &str) -> WorkflowError {
        warn!(
            project_id = %request.project_id,
            document_id = %request.document_id,
            reason,
            "Run precondition failed"
        );
        WorkflowError::PreconditionFailed {
            document_id: request.document_id,
            reason: reason.to_string(),
        }
    }

    async fn drive(&self, state: WorkflowState) -> Result<RunOutcome> {
        let run_id = state.run_id.clone();

        let final_state = match self
            .executor
            .execute(state, Some(self.registry.as_ref()))
            .await
        {
            Ok(state) => Arc::new(state),
            Err(e) => {
                self.mark_failed(&run_id, &e);
                return Err(e);
            }
        };

        let record = final_state.to_insights(&self.model_used, Utc::now());
        let persistence_error = match self.repository.upsert_insights(record).await {
            Ok(()) => None,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to persist insights");
                self.event_bus.publish(WorkflowEvent::PersistenceFailed {
                    run_id: run_id.clone(),
                    error: e.to_string(),
                });
                Some(e.to_string())
            }
        };

        // Readers see `Completed` only once the save has been attempted.
        self.registry.store(Arc::clone(&final_state));

        let summary = RunSummary::from_state(&final_state);
        info!(
            run_id = %run_id,
            challenges = summary.challenges_count,
            value_propositions = summary.value_propositions_count,
            case_studies = summary.case_studies_count,
            proposal_created = summary.proposal_created,
            errors = summary.errors_count,
            durable = persistence_error.is_none(),
            "Run finished"
        );

        Ok(RunOutcome {
            run_id,
            success: true,
            summary,
            state: final_state,
            persistence_error,
        })
    }

    /// Record an executor fault on the registered run.
    fn mark_failed(&self, run_id: &RunId, e: &WorkflowError) {
        error!(run_id = %run_id, error = %e, "Run aborted");
        if let Some(last) = self.registry.get(run_id) {
            let mut failed = (*last).clone();
            failed.status = RunStatus::Failed;
            failed.errors.push(format!("Executor: {}", e));
            failed.finished_at = Some(Utc::now());
            self.registry.store(Arc::new(failed));
        }
        self.event_bus.publish(WorkflowEvent::RunFailed {
            run_id: run_id.clone(),
            error: e.to_string(),
        });
    }
}
