use std::collections::BTreeMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use tracing::debug;

use rfpflow_core::error::{Result, WorkflowError};
use rfpflow_core::state::WorkflowState;
use rfpflow_core::types::StageName;

use super::stage::{RequiredInput, StageSpec};

/// A dependency edge: `to` may not start before `from` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: StageName,
    pub to: StageName,
}

/// A validated, acyclic set of stages.
///
/// Construction rejects duplicate stages, dependencies on unknown stages and
/// cycles, so every `GraphDefinition` can be executed to completion.
#[derive(Debug, Clone)]
pub struct GraphDefinition {
    stages: BTreeMap<StageName, StageSpec>,
    graph: DiGraphMap<StageName, ()>,
    order: Vec<StageName>,
}

impl GraphDefinition {
    pub fn new(specs: Vec<StageSpec>) -> Result<Self> {
        let mut stages = BTreeMap::new();
        for spec in specs {
            let name = spec.name;
            if stages.insert(name, spec).is_some() {
                return Err(WorkflowError::Graph(format!(
                    "stage '{}' declared more than once",
                    name
                )));
            }
        }

        let mut graph = DiGraphMap::new();
        for name in stages.keys() {
            graph.add_node(*name);
        }
        for spec in stages.values() {
            for dep in &spec.depends_on {
                if *dep == spec.name {
                    return Err(WorkflowError::Graph(format!(
                        "stage '{}' depends on itself",
                        spec.name
                    )));
                }
                if !stages.contains_key(dep) {
                    return Err(WorkflowError::Graph(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        spec.name, dep
                    )));
                }
                graph.add_edge(*dep, spec.name, ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            WorkflowError::Graph(format!(
                "dependency cycle through stage '{}'",
                cycle.node_id()
            ))
        })?;

        debug!(stages = order.len(), edges = graph.edge_count(), "Workflow graph validated");

        Ok(Self {
            stages,
            graph,
            order,
        })
    }

    /// The presales pipeline: analyzer, extractor, a three-way fan-out, and
    /// a proposal builder joining all three branches.
    pub fn presales() -> Result<Self> {
        Self::new(vec![
            StageSpec::new(StageName::RfpAnalyzer).requires(RequiredInput::SourceText),
            StageSpec::new(StageName::ChallengeExtractor).after([StageName::RfpAnalyzer]),
            StageSpec::new(StageName::DiscoveryQuestion)
                .after([StageName::ChallengeExtractor])
                .skippable(),
            StageSpec::new(StageName::ValueProposition)
                .after([StageName::ChallengeExtractor])
                .skippable(),
            StageSpec::new(StageName::CaseStudyMatcher)
                .after([StageName::ChallengeExtractor])
                .skippable(),
            StageSpec::new(StageName::ProposalBuilder)
                .after([
                    StageName::DiscoveryQuestion,
                    StageName::ValueProposition,
                    StageName::CaseStudyMatcher,
                ])
                .skippable(),
        ])
    }

    pub fn stage(&self, name: StageName) -> Option<&StageSpec> {
        self.stages.get(&name)
    }

    pub fn contains(&self, name: StageName) -> bool {
        self.stages.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in a dependency-respecting order.
    pub fn topological_order(&self) -> &[StageName] {
        &self.order
    }

    /// Direct upstream stages.
    pub fn dependencies(&self, name: StageName) -> &[StageName] {
        self.stages
            .get(&name)
            .map(|s| s.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// Direct downstream stages, sorted.
    pub fn dependents(&self, name: StageName) -> Vec<StageName> {
        if !self.graph.contains_node(name) {
            return vec![];
        }
        let mut out: Vec<StageName> = self
            .graph
            .neighbors_directed(name, Direction::Outgoing)
            .collect();
        out.sort();
        out
    }

    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .graph
            .all_edges()
            .map(|(from, to, _)| Edge { from, to })
            .collect();
        edges.sort_by_key(|e| (e.from, e.to));
        edges
    }

    /// Stages with no dependencies.
    pub fn roots(&self) -> Vec<StageName> {
        self.stages
            .values()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.name)
            .collect()
    }

    /// Stages whose completion releases more than one stage.
    pub fn fan_out_points(&self) -> Vec<StageName> {
        self.stages
            .keys()
            .copied()
            .filter(|name| self.dependents(*name).len() > 1)
            .collect()
    }

    pub fn join_points(&self) -> Vec<StageName> {
        self.stages
            .values()
            .filter(|s| s.is_join())
            .map(|s| s.name)
            .collect()
    }

    /// Verify every stage's required inputs against the initial record.
    pub fn check_required_inputs(&self, state: &WorkflowState) -> Result<()> {
        for spec in self.stages.values() {
            for input in &spec.required_inputs {
                if !input.is_present(state) {
                    return Err(WorkflowError::PreconditionFailed {
                        document_id: state.document_id,
                        reason: format!("{} requires {}", spec.name.label(), input.as_str()),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfpflow_core::types::{DocumentId, ProjectId, RunId};

    fn position(order: &[StageName], name: StageName) -> usize {
        order.iter().position(|s| *s == name).unwrap()
    }

    #[test]
    fn test_presales_shape() {
        let graph = GraphDefinition::presales().unwrap();
        assert_eq!(graph.len(), 6);
        assert_eq!(graph.roots(), vec![StageName::RfpAnalyzer]);
        assert_eq!(graph.fan_out_points(), vec![StageName::ChallengeExtractor]);
        assert_eq!(graph.join_points(), vec![StageName::ProposalBuilder]);
        assert_eq!(
            graph.dependents(StageName::ChallengeExtractor),
            vec![
                StageName::DiscoveryQuestion,
                StageName::ValueProposition,
                StageName::CaseStudyMatcher,
            ]
        );
        for branch in [
            StageName::DiscoveryQuestion,
            StageName::ValueProposition,
            StageName::CaseStudyMatcher,
        ] {
            assert_eq!(graph.dependents(branch), vec![StageName::ProposalBuilder]);
        }
        assert_eq!(
            graph.dependencies(StageName::ProposalBuilder),
            vec![
                StageName::DiscoveryQuestion,
                StageName::ValueProposition,
                StageName::CaseStudyMatcher,
            ]
        );
        assert_eq!(graph.edges().len(), 7);
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let graph = GraphDefinition::presales().unwrap();
        let order = graph.topological_order();
        for edge in graph.edges() {
            assert!(position(order, edge.from) < position(order, edge.to));
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let err = GraphDefinition::new(vec![
            StageSpec::new(StageName::RfpAnalyzer).after([StageName::ProposalBuilder]),
            StageSpec::new(StageName::ProposalBuilder).after([StageName::RfpAnalyzer]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = GraphDefinition::new(vec![
            StageSpec::new(StageName::ChallengeExtractor).after([StageName::RfpAnalyzer])
        ])
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Graph(_)));
        assert!(err.to_string().contains("unknown stage 'rfp_analyzer'"));
    }

    #[test]
    fn test_duplicate_and_self_dependency_rejected() {
        assert!(GraphDefinition::new(vec![
            StageSpec::new(StageName::RfpAnalyzer),
            StageSpec::new(StageName::RfpAnalyzer),
        ])
        .is_err());
        assert!(GraphDefinition::new(vec![
            StageSpec::new(StageName::RfpAnalyzer).after([StageName::RfpAnalyzer])
        ])
        .is_err());
    }

    #[test]
    fn test_required_inputs_checked() {
        let graph = GraphDefinition::presales().unwrap();
        let empty = WorkflowState::new(RunId::from_str("r"), ProjectId(1), DocumentId(9), "");
        let err = graph.check_required_inputs(&empty).unwrap_err();
        assert!(err.is_precondition());

        let ok = WorkflowState::new(RunId::from_str("r"), ProjectId(1), DocumentId(9), "RFP");
        assert!(graph.check_required_inputs(&ok).is_ok());
    }
}
