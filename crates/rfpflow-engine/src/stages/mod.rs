//! Stage adapters and the set the executor draws them from.
//!
//! Stage internals (prompts, model calls, retrieval) live behind the
//! `StageAdapter` contract. The binary wires each stage either to an HTTP
//! service (`RemoteStage`) or to `UnconfiguredStage`, which reports a stage
//! error so the rest of the graph still runs.

pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use rfpflow_core::config::AppConfig;
use rfpflow_core::state::{PartialUpdate, WorkflowState};
use rfpflow_core::traits::StageAdapter;
use rfpflow_core::types::StageName;

use crate::graph::GraphDefinition;

pub use remote::RemoteStage;

/// Stage adapters keyed by stage name.
#[derive(Clone, Default)]
pub struct StageSet {
    adapters: HashMap<StageName, Arc<dyn StageAdapter>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: StageName, adapter: Arc<dyn StageAdapter>) -> Self {
        self.insert(stage, adapter);
        self
    }

    pub fn insert(&mut self, stage: StageName, adapter: Arc<dyn StageAdapter>) {
        self.adapters.insert(stage, adapter);
    }

    pub fn get(&self, stage: StageName) -> Option<Arc<dyn StageAdapter>> {
        self.adapters.get(&stage).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Graph stages with no adapter, in topological order.
    pub fn missing(&self, graph: &GraphDefinition) -> Vec<StageName> {
        graph
            .topological_order()
            .iter()
            .copied()
            .filter(|s| !self.adapters.contains_key(s))
            .collect()
    }

    /// One adapter per stage: `RemoteStage` where `[stages.<name>]` is
    /// configured, `UnconfiguredStage` otherwise.
    pub fn from_config(config: &AppConfig) -> Self {
        StageName::ALL
            .into_iter()
            .map(|stage| {
                let adapter: Arc<dyn StageAdapter> = match config.stage_endpoint(stage) {
                    Some(endpoint) => Arc::new(RemoteStage::from_config(stage, endpoint)),
                    None => Arc::new(UnconfiguredStage),
                };
                (stage, adapter)
            })
            .collect()
    }
}

impl FromIterator<(StageName, Arc<dyn StageAdapter>)> for StageSet {
    fn from_iter<I: IntoIterator<Item = (StageName, Arc<dyn StageAdapter>)>>(iter: I) -> Self {
        Self {
            adapters: iter.into_iter().collect(),
        }
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.adapters.keys().collect();
        names.sort();
        f.debug_struct("StageSet").field("stages", &names).finish()
    }
}

/// Placeholder for a stage with no service behind it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredStage;

impl StageAdapter for UnconfiguredStage {
    fn execute(&self, _state: Arc<WorkflowState>) -> BoxFuture<'_, PartialUpdate> {
        Box::pin(async { PartialUpdate::failed("stage not configured") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfpflow_core::types::{DocumentId, ProjectId, RunId};

    #[test]
    fn test_missing_stages_reported_in_order() {
        let graph = GraphDefinition::presales().unwrap();
        let set = StageSet::new()
            .with(StageName::RfpAnalyzer, Arc::new(UnconfiguredStage))
            .with(StageName::CaseStudyMatcher, Arc::new(UnconfiguredStage));
        let missing = set.missing(&graph);
        assert_eq!(missing.len(), 4);
        assert!(!missing.contains(&StageName::RfpAnalyzer));
        assert_eq!(missing[0], StageName::ChallengeExtractor);
    }

    #[test]
    fn test_from_config_covers_every_stage() {
        let config = AppConfig::parse(
            r#"
[stages.rfp_analyzer]
endpoint = "http://localhost:9100/analyze"
"#,
        )
        .unwrap();
        let set = StageSet::from_config(&config);
        assert_eq!(set.len(), 6);
        assert!(set.missing(&GraphDefinition::presales().unwrap()).is_empty());
        assert!(format!("{:?}", set).contains("RfpAnalyzer"));
    }

    #[tokio::test]
    async fn test_unconfigured_stage_reports_error() {
        let state = Arc::new(WorkflowState::new(
            RunId::from_str("r"),
            ProjectId(1),
            DocumentId(1),
            "text",
        ));
        let update = UnconfiguredStage.execute(state).await;
        assert_eq!(update.error.as_deref(), Some("stage not configured"));
        assert!(update.written_fields().is_empty());
    }
}
