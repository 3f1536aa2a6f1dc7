//! Test doubles and fixtures shared by the rfpflow crates.
//!
//! In-memory collaborators for the workflow manager, a scriptable stage
//! adapter that records how it was called, and a canned "happy" output for
//! every stage.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use rfpflow_core::error::{Result, WorkflowError};
use rfpflow_core::state::{PartialUpdate, WorkflowState};
use rfpflow_core::traits::{DocumentSource, InsightsRepository, StageAdapter};
use rfpflow_core::types::{Challenge, DocumentId, InsightsRecord, MatchedCase, ProjectId, StageName};

/// How a `ScriptedStage` behaves when called.
#[derive(Debug, Clone)]
enum Script {
    Return(PartialUpdate),
    Panic(String),
}

/// Stage adapter returning a fixed update.
///
/// Counts calls and keeps every snapshot it was handed, so tests can assert
/// what a stage saw and whether it ran at all.
#[derive(Debug)]
pub struct ScriptedStage {
    script: Script,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<Arc<WorkflowState>>>,
}

impl ScriptedStage {
    pub fn new(update: PartialUpdate) -> Self {
        Self {
            script: Script::Return(update),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Reports a stage error, the way an adapter that caught an internal
    /// exception would.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(PartialUpdate::failed(message))
    }

    /// Panics inside `execute`.
    pub fn panicking(message: impl Into<String>) -> Self {
        Self {
            script: Script::Panic(message.into()),
            ..Self::new(PartialUpdate::new())
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Snapshots received, in call order.
    pub fn seen(&self) -> Vec<Arc<WorkflowState>> {
        self.seen.lock().unwrap().clone()
    }
}

impl StageAdapter for ScriptedStage {
    fn execute(&self, state: Arc<WorkflowState>) -> BoxFuture<'_, PartialUpdate> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(state);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.script {
                Script::Return(update) => update.clone(),
                Script::Panic(message) => panic!("{}", message),
            }
        })
    }
}

// Fixtures

pub fn sample_challenges() -> Vec<Challenge> {
    vec![
        Challenge::new("Legacy CRM cannot scale past 10k accounts", "Technical")
            .with_impact("High")
            .with_category("Technology"),
        Challenge::new("Sales cycle has grown to nine months", "Business")
            .with_impact("Medium")
            .with_category("Business"),
    ]
}

pub fn sample_case() -> MatchedCase {
    MatchedCase {
        id: 11,
        title: "Retail bank CRM consolidation".into(),
        industry: "Financial Services".into(),
        impact: "40% faster onboarding".into(),
        description: "Merged three CRMs into one platform.".into(),
        relevance_score: 0.87,
    }
}

/// The update a well-behaved stage produces.
///
/// Across the whole pipeline this yields 2 challenges, 1 value proposition,
/// 1 matched case and a non-empty proposal draft.
pub fn happy_update(stage: StageName) -> PartialUpdate {
    match stage {
        StageName::RfpAnalyzer => PartialUpdate::new()
            .with_summary("Acme Corp seeks to replace its legacy CRM.")
            .with_context_overview("Mid-size distributor, 400 sales staff.")
            .with_business_objectives(vec!["Shorten sales cycle".into(), "Cut licence cost".into()])
            .with_project_scope("CRM migration and sales enablement"),
        StageName::ChallengeExtractor => PartialUpdate::new().with_challenges(sample_challenges()),
        StageName::DiscoveryQuestion => PartialUpdate::new().with_discovery_questions(
            [
                ("Business".to_string(), vec!["Who owns the pipeline KPIs?".to_string()]),
                ("Technology".to_string(), vec!["Which systems feed the CRM?".to_string()]),
            ]
            .into(),
        ),
        StageName::ValueProposition => PartialUpdate::new()
            .with_value_propositions(vec!["One CRM, half the licence cost".into()]),
        StageName::CaseStudyMatcher => PartialUpdate::new().with_matched_cases(vec![sample_case()]),
        StageName::ProposalBuilder => PartialUpdate::new().with_proposal_draft(
            [
                ("executive_summary".to_string(), "We propose a phased migration.".to_string()),
                ("solution".to_string(), "Consolidate onto a single CRM.".to_string()),
            ]
            .into(),
        ),
    }
}

pub fn happy_stage(stage: StageName) -> ScriptedStage {
    ScriptedStage::new(happy_update(stage))
}

/// A happy adapter for every stage, ready to collect into a stage set.
pub fn happy_adapters() -> Vec<(StageName, Arc<dyn StageAdapter>)> {
    StageName::ALL
        .into_iter()
        .map(|stage| (stage, Arc::new(happy_stage(stage)) as Arc<dyn StageAdapter>))
        .collect()
}

/// Document source backed by a map.
#[derive(Debug, Default)]
pub struct MemoryDocuments {
    texts: Mutex<HashMap<DocumentId, String>>,
    unavailable: bool,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every lookup fails with a document source error.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn with_document(self, id: DocumentId, text: impl Into<String>) -> Self {
        self.insert(id, text);
        self
    }

    pub fn insert(&self, id: DocumentId, text: impl Into<String>) {
        self.texts.lock().unwrap().insert(id, text.into());
    }
}

impl DocumentSource for MemoryDocuments {
    fn extracted_text(&self, document_id: DocumentId) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            if self.unavailable {
                return Err(WorkflowError::DocumentSource("document store offline".into()));
            }
            Ok(self.texts.lock().unwrap().get(&document_id).cloned())
        })
    }
}

/// Insights repository backed by a map, optionally failing or stalling
/// every save.
#[derive(Debug, Default)]
pub struct MemoryInsights {
    records: Mutex<HashMap<ProjectId, InsightsRecord>>,
    saves: AtomicUsize,
    failing: bool,
    delay: Duration,
}

impl MemoryInsights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Sleep this long inside every save before storing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn get(&self, project_id: ProjectId) -> Option<InsightsRecord> {
        self.records.lock().unwrap().get(&project_id).cloned()
    }

    /// Successful saves so far.
    pub fn saved_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl InsightsRepository for MemoryInsights {
    fn upsert_insights(&self, record: InsightsRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing {
                return Err(WorkflowError::Persistence("disk full".into()));
            }
            self.records.lock().unwrap().insert(record.project_id, record);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn load_insights(&self, project_id: ProjectId) -> BoxFuture<'_, Result<Option<InsightsRecord>>> {
        Box::pin(async move { Ok(self.get(project_id)) })
    }
}

/// Write a TOML config to a temp file that lives as long as the handle.
pub fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}
