//! The per-run state record and the policy that merges stage results into it.
//!
//! A `WorkflowState` is created with every output empty, mutated only by the
//! executor through a `MergePolicy`, and frozen once the executor returns.
//! Stages never see the record directly: they receive a `StageInput`
//! projection built from a snapshot taken after all their dependencies merged.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    Challenge, DiscoveryQuestions, DocumentId, ExecutionLogEntry, InsightsRecord, MatchedCase,
    ProjectId, ProposalDraft, RunId, RunStatus, StageName, StageStatus, TaskSelection,
};

/// The evolving record threaded through a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    // Identity
    pub run_id: RunId,
    pub project_id: ProjectId,
    pub document_id: DocumentId,

    // Inputs
    pub source_text: String,
    #[serde(default)]
    pub retrieved_context: Option<String>,

    // rfp_analyzer
    #[serde(rename = "rfp_summary")]
    pub summary: Option<String>,
    pub context_overview: Option<String>,
    pub business_objectives: Option<Vec<String>>,
    pub project_scope: Option<String>,

    // challenge_extractor
    pub challenges: Option<Vec<Challenge>>,

    // fan-out branches
    pub discovery_questions: Option<DiscoveryQuestions>,
    pub value_propositions: Option<Vec<String>>,
    #[serde(rename = "matching_case_studies")]
    pub matched_cases: Option<Vec<MatchedCase>>,

    // proposal_builder
    pub proposal_draft: Option<ProposalDraft>,

    // Accumulators: only ever appended to.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub execution_log: Vec<ExecutionLogEntry>,

    // Control
    /// Most recently entered stage. Coarse under concurrency; see `stage_status`.
    pub current_stage: Option<StageName>,
    pub stage_status: BTreeMap<StageName, StageStatus>,
    pub disabled_stages: BTreeSet<StageName>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Fresh record: all outputs empty, accumulators empty, status pending.
    pub fn new(
        run_id: RunId,
        project_id: ProjectId,
        document_id: DocumentId,
        source_text: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            project_id,
            document_id,
            source_text: source_text.into(),
            retrieved_context: None,
            summary: None,
            context_overview: None,
            business_objectives: None,
            project_scope: None,
            challenges: None,
            discovery_questions: None,
            value_propositions: None,
            matched_cases: None,
            proposal_draft: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            execution_log: Vec::new(),
            current_stage: None,
            stage_status: StageName::ALL
                .into_iter()
                .map(|s| (s, StageStatus::Pending))
                .collect(),
            disabled_stages: BTreeSet::new(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_retrieved_context(mut self, context: Option<String>) -> Self {
        self.retrieved_context = context;
        self
    }

    /// Carry a resolved task selection onto the record. Selection warnings
    /// are appended to the warnings accumulator.
    pub fn with_selection(mut self, selection: &TaskSelection) -> Self {
        self.disabled_stages = selection.disabled().clone();
        self.warnings.extend(selection.warnings().iter().cloned());
        self
    }

    pub fn is_enabled(&self, stage: StageName) -> bool {
        !self.disabled_stages.contains(&stage)
    }

    pub fn status_of(&self, stage: StageName) -> StageStatus {
        self.stage_status
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    /// Number of execution log entries recorded for a stage.
    pub fn log_count(&self, stage: StageName) -> usize {
        self.execution_log.iter().filter(|e| e.stage == stage).count()
    }

    /// Errors tagged for the given stage.
    pub fn errors_for(&self, stage: StageName) -> Vec<&str> {
        let prefix = format!("{}: ", stage.label());
        self.errors
            .iter()
            .filter(|e| e.starts_with(&prefix))
            .map(|e| e.as_str())
            .collect()
    }

    /// Durable projection handed to the insights repository.
    pub fn to_insights(&self, model_used: &str, analyzed_at: DateTime<Utc>) -> InsightsRecord {
        InsightsRecord {
            project_id: self.project_id,
            executive_summary: self.summary.clone(),
            challenges: self.challenges.clone(),
            value_propositions: self.value_propositions.clone(),
            discovery_questions: self.discovery_questions.clone(),
            tags: self.business_objectives.clone(),
            matched_cases: self.matched_cases.clone(),
            model_used: model_used.to_string(),
            analyzed_at,
        }
    }
}

/// The result a stage adapter hands back: output assignments, at most one
/// error, and warnings to append.
///
/// Deserializes from the JSON a stage service replies with; every field is
/// optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialUpdate {
    #[serde(rename = "rfp_summary", skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_overview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_objectives: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenges: Option<Vec<Challenge>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_questions: Option<DiscoveryQuestions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_propositions: Option<Vec<String>>,
    #[serde(rename = "matching_case_studies", skip_serializing_if = "Option::is_none")]
    pub matched_cases: Option<Vec<MatchedCase>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_draft: Option<ProposalDraft>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Free-form note recorded in the execution log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PartialUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// An update carrying only an error; all outputs stay empty.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Default-empty output of a stage that was skipped.
    pub fn skipped_default(stage: StageName) -> Self {
        let mut update = Self::default();
        match stage {
            StageName::DiscoveryQuestion => update.discovery_questions = Some(BTreeMap::new()),
            StageName::ValueProposition => update.value_propositions = Some(Vec::new()),
            StageName::CaseStudyMatcher => update.matched_cases = Some(Vec::new()),
            StageName::ProposalBuilder => update.proposal_draft = Some(BTreeMap::new()),
            StageName::RfpAnalyzer | StageName::ChallengeExtractor => {}
        }
        update
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_context_overview(mut self, overview: impl Into<String>) -> Self {
        self.context_overview = Some(overview.into());
        self
    }

    pub fn with_business_objectives(mut self, objectives: Vec<String>) -> Self {
        self.business_objectives = Some(objectives);
        self
    }

    pub fn with_project_scope(mut self, scope: impl Into<String>) -> Self {
        self.project_scope = Some(scope.into());
        self
    }

    pub fn with_challenges(mut self, challenges: Vec<Challenge>) -> Self {
        self.challenges = Some(challenges);
        self
    }

    pub fn with_discovery_questions(mut self, questions: DiscoveryQuestions) -> Self {
        self.discovery_questions = Some(questions);
        self
    }

    pub fn with_value_propositions(mut self, props: Vec<String>) -> Self {
        self.value_propositions = Some(props);
        self
    }

    pub fn with_matched_cases(mut self, cases: Vec<MatchedCase>) -> Self {
        self.matched_cases = Some(cases);
        self
    }

    pub fn with_proposal_draft(mut self, draft: ProposalDraft) -> Self {
        self.proposal_draft = Some(draft);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Names of output fields set on this update.
    pub fn written_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.summary.is_some() {
            fields.push("rfp_summary");
        }
        if self.context_overview.is_some() {
            fields.push("context_overview");
        }
        if self.business_objectives.is_some() {
            fields.push("business_objectives");
        }
        if self.project_scope.is_some() {
            fields.push("project_scope");
        }
        if self.challenges.is_some() {
            fields.push("challenges");
        }
        if self.discovery_questions.is_some() {
            fields.push("discovery_questions");
        }
        if self.value_propositions.is_some() {
            fields.push("value_propositions");
        }
        if self.matched_cases.is_some() {
            fields.push("matching_case_studies");
        }
        if self.proposal_draft.is_some() {
            fields.push("proposal_draft");
        }
        fields
    }

    /// Short description used when the adapter gave no detail.
    fn describe(&self, stage: StageName) -> Option<String> {
        match stage {
            StageName::RfpAnalyzer => self
                .summary
                .as_ref()
                .map(|s| format!("summary_chars={}", s.chars().count())),
            StageName::ChallengeExtractor => self
                .challenges
                .as_ref()
                .map(|c| format!("challenges_count={}", c.len())),
            StageName::DiscoveryQuestion => self
                .discovery_questions
                .as_ref()
                .map(|q| format!("questions_count={}", q.values().map(Vec::len).sum::<usize>())),
            StageName::ValueProposition => self
                .value_propositions
                .as_ref()
                .map(|v| format!("value_props_count={}", v.len())),
            StageName::CaseStudyMatcher => self
                .matched_cases
                .as_ref()
                .map(|c| format!("case_studies_count={}", c.len())),
            StageName::ProposalBuilder => self
                .proposal_draft
                .as_ref()
                .map(|d| format!("sections={}", d.len())),
        }
    }
}

/// Output fields each stage is allowed to write.
pub fn owned_fields(stage: StageName) -> &'static [&'static str] {
    match stage {
        StageName::RfpAnalyzer => &[
            "rfp_summary",
            "context_overview",
            "business_objectives",
            "project_scope",
        ],
        StageName::ChallengeExtractor => &["challenges"],
        StageName::DiscoveryQuestion => &["discovery_questions"],
        StageName::ValueProposition => &["value_propositions"],
        StageName::CaseStudyMatcher => &["matching_case_studies"],
        StageName::ProposalBuilder => &["proposal_draft"],
    }
}

/// Read-only projection of the record a stage is allowed to consume.
///
/// Absent upstream outputs are presented as empty defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageInput {
    pub stage: Option<StageName>,
    pub project_id: Option<ProjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfp_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieved_context: Option<String>,
    pub rfp_summary: String,
    pub business_objectives: Vec<String>,
    pub challenges: Vec<Challenge>,
    pub value_propositions: Vec<String>,
    pub matching_case_studies: Vec<MatchedCase>,
}

impl StageInput {
    pub fn for_stage(stage: StageName, state: &WorkflowState) -> Self {
        let mut input = Self {
            stage: Some(stage),
            project_id: Some(state.project_id),
            ..Self::default()
        };
        let summary = || state.summary.clone().unwrap_or_default();
        let challenges = || state.challenges.clone().unwrap_or_default();

        match stage {
            StageName::RfpAnalyzer => {
                input.rfp_text = Some(state.source_text.clone());
                input.retrieved_context = state.retrieved_context.clone();
            }
            StageName::ChallengeExtractor => {
                input.rfp_summary = summary();
                input.business_objectives = state.business_objectives.clone().unwrap_or_default();
            }
            StageName::DiscoveryQuestion | StageName::CaseStudyMatcher => {
                input.challenges = challenges();
            }
            StageName::ValueProposition => {
                input.rfp_summary = summary();
                input.challenges = challenges();
            }
            StageName::ProposalBuilder => {
                input.rfp_summary = summary();
                input.challenges = challenges();
                input.value_propositions = state.value_propositions.clone().unwrap_or_default();
                input.matching_case_studies = state.matched_cases.clone().unwrap_or_default();
            }
        }
        input
    }
}

/// What the executor learned from running (or skipping) one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub stage: StageName,
    pub status: StageStatus,
    pub update: PartialUpdate,
    pub elapsed_ms: u64,
}

impl StageOutcome {
    pub fn new(stage: StageName, status: StageStatus, update: PartialUpdate, elapsed_ms: u64) -> Self {
        Self {
            stage,
            status,
            update,
            elapsed_ms,
        }
    }

    pub fn skipped(stage: StageName) -> Self {
        Self::new(
            stage,
            StageStatus::Skipped,
            PartialUpdate::skipped_default(stage),
            0,
        )
    }
}

/// Reconciles a stage outcome with the shared record.
///
/// Implementations run on the executor's own task, one outcome at a time, so
/// they never race with each other.
pub trait MergePolicy: Send + Sync + 'static {
    fn merge(&self, state: &mut WorkflowState, outcome: StageOutcome);
}

/// Overwrite for singly-produced output fields, append for accumulators.
///
/// - Output fields are applied only when the stage succeeded or was skipped,
///   and only if the stage owns them; foreign writes are dropped with a warning.
/// - `errors` gains one entry per failed stage, tagged with the stage label.
/// - `warnings` gains the stage's warnings, tagged the same way.
/// - `execution_log` gains exactly one entry per terminal outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMergePolicy;

impl MergePolicy for DefaultMergePolicy {
    fn merge(&self, state: &mut WorkflowState, outcome: StageOutcome) {
        let StageOutcome {
            stage,
            status,
            update,
            elapsed_ms,
        } = outcome;
        let label = stage.label();

        let foreign: Vec<&str> = update
            .written_fields()
            .into_iter()
            .filter(|f| !owned_fields(stage).contains(f))
            .collect();
        for field in &foreign {
            state
                .warnings
                .push(format!("{}: wrote field '{}' it does not own; ignored", label, field));
        }

        let error = update.error.clone();
        let detail = match (&error, status) {
            (Some(err), _) => Some(err.clone()),
            (None, StageStatus::Skipped) => Some("disabled by task selection".to_string()),
            (None, _) => update.detail.clone().or_else(|| update.describe(stage)),
        };

        for warning in &update.warnings {
            state.warnings.push(format!("{}: {}", label, warning));
        }

        match (error, status) {
            (Some(err), _) => state.errors.push(format!("{}: {}", label, err)),
            (None, StageStatus::Succeeded | StageStatus::Skipped) => {
                apply_owned(state, stage, update);
            }
            // The executor records one run-level deadline diagnostic instead.
            (None, StageStatus::Abandoned) => {}
            (None, other) => state
                .errors
                .push(format!("{}: stage ended as {}", label, other)),
        }

        state.stage_status.insert(stage, status);
        state.execution_log.push(ExecutionLogEntry {
            stage,
            status,
            detail,
            elapsed_ms,
        });
    }
}

fn apply_owned(state: &mut WorkflowState, stage: StageName, update: PartialUpdate) {
    match stage {
        StageName::RfpAnalyzer => {
            if update.summary.is_some() {
                state.summary = update.summary;
            }
            if update.context_overview.is_some() {
                state.context_overview = update.context_overview;
            }
            if update.business_objectives.is_some() {
                state.business_objectives = update.business_objectives;
            }
            if update.project_scope.is_some() {
                state.project_scope = update.project_scope;
            }
        }
        StageName::ChallengeExtractor => {
            if update.challenges.is_some() {
                state.challenges = update.challenges;
            }
        }
        StageName::DiscoveryQuestion => {
            if update.discovery_questions.is_some() {
                state.discovery_questions = update.discovery_questions;
            }
        }
        StageName::ValueProposition => {
            if update.value_propositions.is_some() {
                state.value_propositions = update.value_propositions;
            }
        }
        StageName::CaseStudyMatcher => {
            if update.matched_cases.is_some() {
                state.matched_cases = update.matched_cases;
            }
        }
        StageName::ProposalBuilder => {
            if update.proposal_draft.is_some() {
                state.proposal_draft = update.proposal_draft;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WorkflowState {
        WorkflowState::new(
            RunId::from_str("1_2_test"),
            ProjectId(1),
            DocumentId(2),
            "Acme needs cost reduction.",
        )
    }

    #[test]
    fn test_new_state_is_empty() {
        let s = state();
        assert!(s.summary.is_none());
        assert!(s.challenges.is_none());
        assert!(s.proposal_draft.is_none());
        assert!(s.errors.is_empty());
        assert!(s.execution_log.is_empty());
        assert_eq!(s.status, RunStatus::Pending);
        assert!(s
            .stage_status
            .values()
            .all(|st| *st == StageStatus::Pending));
    }

    #[test]
    fn test_merge_success_overwrites_owned_fields() {
        let mut s = state();
        let policy = DefaultMergePolicy;
        let update = PartialUpdate::new()
            .with_challenges(vec![Challenge::new("Cost", "Business")])
            .with_detail("extracted");

        policy.merge(
            &mut s,
            StageOutcome::new(StageName::ChallengeExtractor, StageStatus::Succeeded, update, 12),
        );

        assert_eq!(s.challenges.as_ref().map(Vec::len), Some(1));
        assert_eq!(s.status_of(StageName::ChallengeExtractor), StageStatus::Succeeded);
        assert_eq!(s.execution_log.len(), 1);
        assert_eq!(s.execution_log[0].detail.as_deref(), Some("extracted"));
        assert_eq!(s.execution_log[0].elapsed_ms, 12);
    }

    #[test]
    fn test_merge_error_leaves_outputs_empty() {
        let mut s = state();
        let mut update = PartialUpdate::failed("model unavailable");
        update.matched_cases = Some(vec![MatchedCase::default()]);

        DefaultMergePolicy.merge(
            &mut s,
            StageOutcome::new(StageName::CaseStudyMatcher, StageStatus::Failed, update, 0),
        );

        assert!(s.matched_cases.is_none());
        assert_eq!(s.errors, vec!["Case Study Matcher: model unavailable".to_string()]);
        assert_eq!(s.errors_for(StageName::CaseStudyMatcher).len(), 1);
        assert_eq!(s.execution_log[0].status, StageStatus::Failed);
    }

    #[test]
    fn test_merge_drops_foreign_fields() {
        let mut s = state();
        let update = PartialUpdate::new()
            .with_value_propositions(vec!["Faster close".into()])
            .with_summary("hijacked");

        DefaultMergePolicy.merge(
            &mut s,
            StageOutcome::new(StageName::ValueProposition, StageStatus::Succeeded, update, 0),
        );

        assert_eq!(s.value_propositions, Some(vec!["Faster close".to_string()]));
        assert!(s.summary.is_none());
        assert_eq!(s.warnings.len(), 1);
        assert!(s.warnings[0].contains("rfp_summary"));
    }

    #[test]
    fn test_merge_skipped_applies_defaults() {
        let mut s = state();
        DefaultMergePolicy.merge(&mut s, StageOutcome::skipped(StageName::ProposalBuilder));

        assert_eq!(s.proposal_draft, Some(ProposalDraft::new()));
        assert_eq!(s.status_of(StageName::ProposalBuilder), StageStatus::Skipped);
        assert!(s.errors.is_empty());
    }

    #[test]
    fn test_merge_timeout_without_error_text_is_still_recorded() {
        let mut s = state();
        DefaultMergePolicy.merge(
            &mut s,
            StageOutcome::new(
                StageName::DiscoveryQuestion,
                StageStatus::TimedOut,
                PartialUpdate::new(),
                0,
            ),
        );
        assert_eq!(s.errors.len(), 1);
        assert!(s.errors[0].contains("timed_out"));
    }

    #[test]
    fn test_merge_abandoned_logs_without_error() {
        let mut s = state();
        DefaultMergePolicy.merge(
            &mut s,
            StageOutcome::new(
                StageName::CaseStudyMatcher,
                StageStatus::Abandoned,
                PartialUpdate::new(),
                0,
            ),
        );
        assert!(s.errors.is_empty());
        assert_eq!(s.status_of(StageName::CaseStudyMatcher), StageStatus::Abandoned);
        assert_eq!(s.log_count(StageName::CaseStudyMatcher), 1);
    }

    #[test]
    fn test_accumulators_only_grow() {
        let mut s = state();
        DefaultMergePolicy.merge(
            &mut s,
            StageOutcome::new(
                StageName::RfpAnalyzer,
                StageStatus::Failed,
                PartialUpdate::failed("first"),
                0,
            ),
        );
        DefaultMergePolicy.merge(
            &mut s,
            StageOutcome::new(
                StageName::ChallengeExtractor,
                StageStatus::Succeeded,
                PartialUpdate::new().with_warning("thin input"),
                0,
            ),
        );
        assert_eq!(s.errors.len(), 1);
        assert_eq!(s.warnings, vec!["Challenge Extractor: thin input".to_string()]);
        assert_eq!(s.execution_log.len(), 2);
    }

    #[test]
    fn test_stage_input_defaults_missing_upstream() {
        let s = state();
        let input = StageInput::for_stage(StageName::ProposalBuilder, &s);
        assert_eq!(input.rfp_summary, "");
        assert!(input.challenges.is_empty());
        assert!(input.value_propositions.is_empty());
        assert!(input.rfp_text.is_none());

        let input = StageInput::for_stage(StageName::RfpAnalyzer, &s);
        assert_eq!(input.rfp_text.as_deref(), Some("Acme needs cost reduction."));
    }

    #[test]
    fn test_partial_update_from_service_json() {
        let update: PartialUpdate = serde_json::from_str(
            r#"{"matching_case_studies": [{"id": 4, "title": "Bank migration", "relevance_score": 0.9}]}"#,
        )
        .unwrap();
        let cases = update.matched_cases.unwrap();
        assert_eq!(cases[0].id, 4);
        assert_eq!(cases[0].industry, "");
        assert!(update.error.is_none());
    }

    #[test]
    fn test_to_insights_maps_objectives_to_tags() {
        let mut s = state();
        s.summary = Some("Summary".into());
        s.business_objectives = Some(vec!["Reduce cost".into()]);
        let record = s.to_insights("gpt-4o", Utc::now());
        assert_eq!(record.executive_summary.as_deref(), Some("Summary"));
        assert_eq!(record.tags, Some(vec!["Reduce cost".to_string()]));
        assert_eq!(record.model_used, "gpt-4o");
    }
}
