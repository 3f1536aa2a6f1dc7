use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Project identifier, owned by the calling API layer.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub i64);

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source document identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub i64);

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique run identifier.
///
/// The `{project}_{document}` prefix keeps ids readable and groupable; the
/// random suffix makes every invocation distinct so a rerun never clobbers
/// the record of an earlier one.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(project_id: ProjectId, document_id: DocumentId) -> Self {
        Self(format!(
            "{}_{}_{}",
            project_id,
            document_id,
            Uuid::new_v4().simple()
        ))
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The deterministic `{project}_{document}` prefix.
    pub fn pair_key(&self) -> &str {
        match self.0.rfind('_') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The six pipeline stages.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    RfpAnalyzer,
    ChallengeExtractor,
    DiscoveryQuestion,
    ValueProposition,
    CaseStudyMatcher,
    ProposalBuilder,
}

impl StageName {
    pub const ALL: [StageName; 6] = [
        StageName::RfpAnalyzer,
        StageName::ChallengeExtractor,
        StageName::DiscoveryQuestion,
        StageName::ValueProposition,
        StageName::CaseStudyMatcher,
        StageName::ProposalBuilder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RfpAnalyzer => "rfp_analyzer",
            Self::ChallengeExtractor => "challenge_extractor",
            Self::DiscoveryQuestion => "discovery_question",
            Self::ValueProposition => "value_proposition",
            Self::CaseStudyMatcher => "case_study_matcher",
            Self::ProposalBuilder => "proposal_builder",
        }
    }

    /// Human-readable label, used to tag diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RfpAnalyzer => "RFP Analyzer",
            Self::ChallengeExtractor => "Challenge Extractor",
            Self::DiscoveryQuestion => "Discovery Question",
            Self::ValueProposition => "Value Proposition",
            Self::CaseStudyMatcher => "Case Study Matcher",
            Self::ProposalBuilder => "Proposal Builder",
        }
    }

    /// Parse a canonical stage name (`"case_study_matcher"`).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A business or technical challenge extracted from the source document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Challenge {
    pub description: String,
    /// Business, Technical, Compliance or Operational.
    #[serde(rename = "type")]
    pub kind: String,
    /// High, Medium or Low.
    pub impact: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution_direction: Option<String>,
}

impl Challenge {
    pub fn new(description: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.impact = impact.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

/// A reference case matched against the extracted challenges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchedCase {
    pub id: i64,
    pub title: String,
    pub industry: String,
    pub impact: String,
    pub description: String,
    pub relevance_score: f64,
}

/// Discovery questions keyed by category (Business, Technology, KPIs, ...).
pub type DiscoveryQuestions = BTreeMap<String, Vec<String>>;

/// Proposal sections keyed by section name (executive_summary, ...).
pub type ProposalDraft = BTreeMap<String, String>;

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
    /// Still outstanding when the run deadline expired.
    Abandoned,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "success",
            Self::Failed => "error",
            Self::Skipped => "skipped",
            Self::TimedOut => "timed_out",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// One execution log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub stage: StageName,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// Caller-provided stage selection, resolved against the skippable stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSelection {
    disabled: BTreeSet<StageName>,
    warnings: Vec<String>,
}

impl TaskSelection {
    /// Everything enabled.
    pub fn all() -> Self {
        Self::default()
    }

    /// Resolve a `{key: enabled}` map. Keys may be canonical stage names or
    /// the short aliases `questions`, `challenges`, `cases` and `proposal`.
    pub fn from_map(selected: &HashMap<String, bool>) -> Self {
        let mut selection = Self::default();
        let mut keys: Vec<_> = selected.iter().collect();
        keys.sort();

        for (key, enabled) in keys {
            let Some(stage) = resolve_task_key(key) else {
                selection
                    .warnings
                    .push(format!("Unknown task '{}' in selection; ignored", key));
                continue;
            };
            if *enabled {
                continue;
            }
            if !Self::is_selectable(stage) {
                selection.warnings.push(format!(
                    "Stage {} cannot be disabled; it will run",
                    stage
                ));
                continue;
            }
            selection.disabled.insert(stage);
        }
        selection
    }

    /// Disable a single stage.
    pub fn without(mut self, stage: StageName) -> Self {
        if Self::is_selectable(stage) {
            self.disabled.insert(stage);
        }
        self
    }

    pub fn is_selectable(stage: StageName) -> bool {
        matches!(
            stage,
            StageName::DiscoveryQuestion
                | StageName::ValueProposition
                | StageName::CaseStudyMatcher
                | StageName::ProposalBuilder
        )
    }

    pub fn is_enabled(&self, stage: StageName) -> bool {
        !self.disabled.contains(&stage)
    }

    pub fn disabled(&self) -> &BTreeSet<StageName> {
        &self.disabled
    }

    /// Problems found while resolving the selection map.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

fn resolve_task_key(key: &str) -> Option<StageName> {
    match key {
        "questions" => Some(StageName::DiscoveryQuestion),
        "challenges" => Some(StageName::ValueProposition),
        "cases" => Some(StageName::CaseStudyMatcher),
        "proposal" => Some(StageName::ProposalBuilder),
        other => StageName::from_name(other),
    }
}

/// The durable projection of a finished run handed to the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightsRecord {
    pub project_id: ProjectId,
    pub executive_summary: Option<String>,
    pub challenges: Option<Vec<Challenge>>,
    pub value_propositions: Option<Vec<String>>,
    pub discovery_questions: Option<DiscoveryQuestions>,
    /// Business objectives double as tags.
    pub tags: Option<Vec<String>>,
    pub matched_cases: Option<Vec<MatchedCase>>,
    pub model_used: String,
    pub analyzed_at: DateTime<Utc>,
}

/// Workflow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Run registered and about to execute.
    RunStarted { run_id: RunId, project_id: ProjectId },
    /// A stage was dispatched.
    StageStarted { run_id: RunId, stage: StageName },
    /// A stage reached a terminal state.
    StageFinished {
        run_id: RunId,
        stage: StageName,
        status: StageStatus,
        elapsed_ms: u64,
        detail: Option<String>,
    },
    /// The run deadline expired with stages outstanding.
    RunDeadlineExceeded {
        run_id: RunId,
        abandoned: Vec<StageName>,
    },
    /// The executor returned a final record.
    RunCompleted {
        run_id: RunId,
        error_count: usize,
        elapsed_ms: u64,
    },
    /// The run aborted on an executor-internal fault.
    RunFailed { run_id: RunId, error: String },
    /// The durable save failed after the run completed.
    PersistenceFailed { run_id: RunId, error: String },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageFinished { run_id, .. }
            | Self::RunDeadlineExceeded { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::PersistenceFailed { run_id, .. } => run_id,
        }
    }
}
