use serde::{Deserialize, Serialize};

use rfpflow_core::state::WorkflowState;
use rfpflow_core::types::StageName;

/// An input a stage cannot start without.
///
/// Checked once, before the run begins. A missing required input fails the
/// whole invocation rather than producing a stage error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredInput {
    /// Non-empty extracted document text.
    SourceText,
}

impl RequiredInput {
    pub fn is_present(&self, state: &WorkflowState) -> bool {
        match self {
            Self::SourceText => !state.source_text.trim().is_empty(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceText => "source_text",
        }
    }
}

/// A stage in the workflow graph.
///
/// A stage runs once every stage in `depends_on` has reached a terminal
/// status, whether that status is success, failure or skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: StageName,
    /// Stages that must finish before this one starts.
    #[serde(default)]
    pub depends_on: Vec<StageName>,
    /// Whether task selection may disable this stage.
    #[serde(default)]
    pub skippable: bool,
    #[serde(default)]
    pub required_inputs: Vec<RequiredInput>,
}

impl StageSpec {
    pub fn new(name: StageName) -> Self {
        Self {
            name,
            depends_on: vec![],
            skippable: false,
            required_inputs: vec![],
        }
    }

    /// Set the upstream stages.
    pub fn after(mut self, deps: impl IntoIterator<Item = StageName>) -> Self {
        self.depends_on = deps.into_iter().collect();
        self
    }

    /// Allow task selection to disable this stage.
    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    pub fn requires(mut self, input: RequiredInput) -> Self {
        if !self.required_inputs.contains(&input) {
            self.required_inputs.push(input);
        }
        self
    }

    /// A join waits on more than one upstream stage.
    pub fn is_join(&self) -> bool {
        self.depends_on.len() > 1
    }
}
