use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use rfpflow_core::config::WorkflowConfig;
use rfpflow_core::error::{Result, WorkflowError};
use rfpflow_core::event::EventBus;
use rfpflow_core::state::{DefaultMergePolicy, MergePolicy, PartialUpdate, StageOutcome, WorkflowState};
use rfpflow_core::traits::{ProgressSink, StageAdapter};
use rfpflow_core::types::{RunStatus, StageName, StageStatus, WorkflowEvent};

use super::definition::GraphDefinition;
use crate::stages::StageSet;

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Executes a workflow graph against one state record.
///
/// The executor is the only writer of the record. Each ready stage runs as
/// its own task on a snapshot taken after all of its dependencies merged;
/// results come back to the executor and are merged one at a time through
/// the `MergePolicy`. A stage runs once all its dependencies are terminal,
/// regardless of whether they succeeded.
pub struct DagExecutor {
    graph: GraphDefinition,
    stages: StageSet,
    merge: Arc<dyn MergePolicy>,
    event_bus: Arc<EventBus>,
    stage_timeout: Duration,
    run_deadline: Option<Duration>,
}

impl DagExecutor {
    /// Fails if any stage in the graph has no adapter.
    pub fn new(graph: GraphDefinition, stages: StageSet, event_bus: Arc<EventBus>) -> Result<Self> {
        let missing = stages.missing(&graph);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
            return Err(WorkflowError::Graph(format!(
                "no adapter registered for: {}",
                names.join(", ")
            )));
        }
        Ok(Self {
            graph,
            stages,
            merge: Arc::new(DefaultMergePolicy),
            event_bus,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            run_deadline: None,
        })
    }

    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge = policy;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.run_deadline = deadline;
        self
    }

    /// Apply `[workflow]` timeouts. A run deadline of 0 means none.
    pub fn with_config(self, config: &WorkflowConfig) -> Self {
        let deadline = match config.run_deadline_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        self.with_stage_timeout(Duration::from_secs(config.stage_timeout_secs))
            .with_run_deadline(deadline)
    }

    pub fn graph(&self) -> &GraphDefinition {
        &self.graph
    }

    /// Run every stage of the graph and return the final record.
    ///
    /// Stage failures, panics and timeouts are recorded in the record and
    /// never returned as `Err`. `Err` means a precondition failed before any
    /// stage ran, or the executor itself could not join a stage task.
    ///
    /// `progress` receives in-flight snapshots only; the returned record is
    /// never published to it.
    pub async fn execute(
        &self,
        mut state: WorkflowState,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<WorkflowState> {
        self.graph.check_required_inputs(&state)?;

        let run_id = state.run_id.clone();
        let start = Instant::now();
        let deadline = self
            .run_deadline
            .map(|d| tokio::time::Instant::now() + d);

        state.status = RunStatus::Running;
        state.started_at = Some(Utc::now());

        let mut pending: Vec<StageName> = self.graph.topological_order().to_vec();
        let mut finished: HashSet<StageName> = HashSet::new();
        let mut in_flight: BTreeSet<StageName> = BTreeSet::new();
        let mut running: JoinSet<StageOutcome> = JoinSet::new();
        let mut deadline_hit = false;

        info!(run_id = %run_id, stages = pending.len(), "Executing workflow graph");

        loop {
            self.dispatch_ready(&mut state, &mut pending, &mut finished, &mut in_flight, &mut running);
            publish(progress, &state);

            if running.is_empty() {
                break;
            }

            let joined = match deadline {
                Some(at) => match tokio::time::timeout_at(at, running.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        self.abandon(&mut state, &pending, &in_flight);
                        running.abort_all();
                        deadline_hit = true;
                        break;
                    }
                },
                None => running.join_next().await,
            };

            let Some(joined) = joined else { break };
            let outcome = joined.map_err(|e| {
                error!(run_id = %run_id, error = %e, "Stage task could not be joined");
                WorkflowError::Executor(format!("stage task failed to join: {}", e))
            })?;

            in_flight.remove(&outcome.stage);
            finished.insert(outcome.stage);
            self.emit_finished(&state, &outcome);
            self.merge.merge(&mut state, outcome);
        }

        if !deadline_hit && !pending.is_empty() {
            let names: Vec<&str> = pending.iter().map(|s| s.as_str()).collect();
            return Err(WorkflowError::Executor(format!(
                "stages never became ready: {}",
                names.join(", ")
            )));
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        // The caller publishes the terminal record once it has been persisted.
        state.status = RunStatus::Completed;
        state.finished_at = Some(Utc::now());

        info!(
            run_id = %run_id,
            errors = state.errors.len(),
            warnings = state.warnings.len(),
            elapsed_ms,
            "Workflow graph complete"
        );
        self.event_bus.publish(WorkflowEvent::RunCompleted {
            run_id,
            error_count: state.errors.len(),
            elapsed_ms,
        });

        Ok(state)
    }

    /// Dispatch every stage whose dependencies are all terminal. Disabled
    /// stages are merged as skipped on the spot, which may release more
    /// stages, so this repeats until nothing new becomes ready.
    fn dispatch_ready(
        &self,
        state: &mut WorkflowState,
        pending: &mut Vec<StageName>,
        finished: &mut HashSet<StageName>,
        in_flight: &mut BTreeSet<StageName>,
        running: &mut JoinSet<StageOutcome>,
    ) {
        loop {
            let ready: Vec<StageName> = pending
                .iter()
                .copied()
                .filter(|s| self.graph.dependencies(*s).iter().all(|d| finished.contains(d)))
                .collect();
            if ready.is_empty() {
                return;
            }
            pending.retain(|s| !ready.contains(s));

            let mut skipped_any = false;
            for stage in ready {
                let skippable = self.graph.stage(stage).is_some_and(|s| s.skippable);
                if skippable && !state.is_enabled(stage) {
                    info!(run_id = %state.run_id, stage = %stage, "Stage disabled by task selection, skipping");
                    let outcome = StageOutcome::skipped(stage);
                    self.emit_finished(state, &outcome);
                    self.merge.merge(state, outcome);
                    finished.insert(stage);
                    skipped_any = true;
                    continue;
                }
                self.spawn_stage(state, stage, running);
                in_flight.insert(stage);
            }

            if !skipped_any {
                return;
            }
        }
    }

    fn spawn_stage(&self, state: &mut WorkflowState, stage: StageName, running: &mut JoinSet<StageOutcome>) {
        state.current_stage = Some(stage);
        state.stage_status.insert(stage, StageStatus::Running);

        let adapter = self.stages.get(stage);
        let timeout = adapter
            .as_ref()
            .and_then(|a| a.timeout_secs())
            .map(Duration::from_secs)
            .unwrap_or(self.stage_timeout);

        debug!(run_id = %state.run_id, stage = %stage, timeout_ms = timeout.as_millis() as u64, "Dispatching stage");
        self.event_bus.publish(WorkflowEvent::StageStarted {
            run_id: state.run_id.clone(),
            stage,
        });

        let snapshot = Arc::new(state.clone());
        running.spawn(run_stage(stage, adapter, snapshot, timeout));
    }

    /// Deadline expiry: record in-flight stages as abandoned, mark stages that
    /// never started, and add one run-level diagnostic.
    fn abandon(&self, state: &mut WorkflowState, pending: &[StageName], in_flight: &BTreeSet<StageName>) {
        let deadline_secs = self.run_deadline.map(|d| d.as_secs()).unwrap_or_default();
        let mut abandoned: Vec<StageName> = in_flight.iter().copied().collect();

        for stage in in_flight {
            let outcome = StageOutcome::new(*stage, StageStatus::Abandoned, PartialUpdate::new(), 0);
            self.emit_finished(state, &outcome);
            self.merge.merge(state, outcome);
        }
        for stage in pending {
            state.stage_status.insert(*stage, StageStatus::Abandoned);
            abandoned.push(*stage);
        }

        let names: Vec<&str> = abandoned.iter().map(|s| s.as_str()).collect();
        warn!(run_id = %state.run_id, abandoned = ?names, "Run deadline exceeded");
        state.errors.push(format!(
            "{}; abandoned stages: {}",
            WorkflowError::RunDeadlineExceeded(deadline_secs),
            names.join(", ")
        ));
        self.event_bus.publish(WorkflowEvent::RunDeadlineExceeded {
            run_id: state.run_id.clone(),
            abandoned,
        });
    }

    fn emit_finished(&self, state: &WorkflowState, outcome: &StageOutcome) {
        match outcome.status {
            StageStatus::Succeeded | StageStatus::Skipped => {
                info!(run_id = %state.run_id, stage = %outcome.stage, status = %outcome.status, elapsed_ms = outcome.elapsed_ms, "Stage finished");
            }
            _ => {
                warn!(
                    run_id = %state.run_id,
                    stage = %outcome.stage,
                    status = %outcome.status,
                    error = outcome.update.error.as_deref().unwrap_or(""),
                    "Stage did not succeed"
                );
            }
        }
        self.event_bus.publish(WorkflowEvent::StageFinished {
            run_id: state.run_id.clone(),
            stage: outcome.stage,
            status: outcome.status,
            elapsed_ms: outcome.elapsed_ms,
            detail: outcome
                .update
                .error
                .clone()
                .or_else(|| outcome.update.detail.clone()),
        });
    }
}

fn publish(progress: Option<&dyn ProgressSink>, state: &WorkflowState) {
    if let Some(sink) = progress {
        sink.publish(state);
    }
}

/// Body of one stage task. Never fails: a panic or timeout is turned into an
/// outcome carrying an error.
async fn run_stage(
    stage: StageName,
    adapter: Option<Arc<dyn StageAdapter>>,
    snapshot: Arc<WorkflowState>,
    timeout: Duration,
) -> StageOutcome {
    let start = Instant::now();
    let Some(adapter) = adapter else {
        return StageOutcome::new(
            stage,
            StageStatus::Failed,
            PartialUpdate::failed("no adapter registered"),
            0,
        );
    };

    // Build the future inside the guard so a panic in `execute` itself is
    // caught too.
    let call = AssertUnwindSafe(async move { adapter.execute(snapshot).await }).catch_unwind();
    let (status, update) = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(update)) if update.is_error() => (StageStatus::Failed, update),
        Ok(Ok(update)) => (StageStatus::Succeeded, update),
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(stage = %stage, panic = %message, "Stage panicked");
            (
                StageStatus::Failed,
                PartialUpdate::failed(format!("stage panicked: {}", message)),
            )
        }
        Err(_) => {
            warn!(stage = %stage, timeout_ms = timeout.as_millis() as u64, "Stage timed out");
            let error = WorkflowError::StageTimeout {
                stage,
                timeout_secs: timeout.as_secs(),
            };
            (StageStatus::TimedOut, PartialUpdate::failed(error.to_string()))
        }
    };

    StageOutcome::new(stage, status, update, start.elapsed().as_millis() as u64)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use rfpflow_core::types::{Challenge, DocumentId, ProjectId, RunId, TaskSelection};

    /// Stage double: returns a fixed update after an optional delay and
    /// records the challenges count it saw.
    struct Fake {
        update: PartialUpdate,
        delay: Duration,
        panics: bool,
        seen: Mutex<Vec<Option<usize>>>,
    }

    impl Fake {
        fn ok(update: PartialUpdate) -> Arc<Self> {
            Arc::new(Self {
                update,
                delay: Duration::ZERO,
                panics: false,
                seen: Mutex::new(vec![]),
            })
        }

        fn slow(update: PartialUpdate, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                update,
                delay,
                panics: false,
                seen: Mutex::new(vec![]),
            })
        }

        fn panicking() -> Arc<Self> {
            Arc::new(Self {
                update: PartialUpdate::new(),
                delay: Duration::ZERO,
                panics: true,
                seen: Mutex::new(vec![]),
            })
        }
    }

    impl StageAdapter for Fake {
        fn execute(&self, state: Arc<WorkflowState>) -> BoxFuture<'_, PartialUpdate> {
            Box::pin(async move {
                self.seen.lock().push(state.challenges.as_ref().map(Vec::len));
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                if self.panics {
                    panic!("model client exploded");
                }
                self.update.clone()
            })
        }
    }

    fn happy_stages() -> StageSet {
        StageSet::new()
            .with(
                StageName::RfpAnalyzer,
                Fake::ok(PartialUpdate::new().with_summary("CRM overhaul")),
            )
            .with(
                StageName::ChallengeExtractor,
                Fake::ok(PartialUpdate::new().with_challenges(vec![
                    Challenge::new("Legacy CRM", "Technical"),
                    Challenge::new("Budget", "Business"),
                ])),
            )
            .with(
                StageName::DiscoveryQuestion,
                Fake::ok(PartialUpdate::new().with_discovery_questions(
                    [("Technical".to_string(), vec!["Which CRM?".to_string()])].into(),
                )),
            )
            .with(
                StageName::ValueProposition,
                Fake::ok(PartialUpdate::new().with_value_propositions(vec!["Lower TCO".into()])),
            )
            .with(
                StageName::CaseStudyMatcher,
                Fake::ok(PartialUpdate::new().with_matched_cases(vec![Default::default()])),
            )
            .with(
                StageName::ProposalBuilder,
                Fake::ok(PartialUpdate::new().with_proposal_draft(
                    [("Executive Summary".to_string(), "...".to_string())].into(),
                )),
            )
    }

    fn state() -> WorkflowState {
        WorkflowState::new(RunId::from_str("1_1_t"), ProjectId(1), DocumentId(1), "RFP text")
    }

    fn executor(stages: StageSet) -> DagExecutor {
        DagExecutor::new(
            GraphDefinition::presales().unwrap(),
            stages,
            Arc::new(EventBus::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_missing_adapter_rejected() {
        let stages = StageSet::new().with(StageName::RfpAnalyzer, Fake::ok(PartialUpdate::new()));
        let err = DagExecutor::new(
            GraphDefinition::presales().unwrap(),
            stages,
            Arc::new(EventBus::default()),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("challenge_extractor"));
    }

    #[tokio::test]
    async fn test_happy_path_runs_every_stage_once() {
        let state = executor(happy_stages()).execute(state(), None).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.errors.is_empty());
        for stage in StageName::ALL {
            assert_eq!(state.log_count(stage), 1, "{}", stage);
            assert_eq!(state.status_of(stage), StageStatus::Succeeded);
        }
        assert_eq!(state.challenges.as_ref().map(Vec::len), Some(2));
        assert!(state.proposal_draft.is_some());
        assert!(state.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_fan_out_sees_extractor_output() {
        let matcher = Fake::ok(PartialUpdate::new().with_matched_cases(vec![]));
        let stages = happy_stages().with(StageName::CaseStudyMatcher, matcher.clone());

        executor(stages).execute(state(), None).await.unwrap();

        assert_eq!(*matcher.seen.lock(), vec![Some(2)]);
    }

    #[tokio::test]
    async fn test_panicking_stage_is_contained() {
        let stages = happy_stages().with(StageName::ValueProposition, Fake::panicking());
        let state = executor(stages).execute(state(), None).await.unwrap();

        let errors = state.errors_for(StageName::ValueProposition);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("model client exploded"));
        assert_eq!(state.log_count(StageName::ProposalBuilder), 1);
        assert!(state.proposal_draft.is_some());
    }

    /// Panics while building its future, before any `.await`.
    struct EagerPanic;

    impl StageAdapter for EagerPanic {
        fn execute(&self, _state: Arc<WorkflowState>) -> BoxFuture<'_, PartialUpdate> {
            let empty: Vec<u8> = vec![];
            let value = empty[3];
            Box::pin(async move { PartialUpdate::new().with_detail(value.to_string()) })
        }
    }

    #[tokio::test]
    async fn test_panic_before_future_is_contained() {
        let stages = happy_stages().with(StageName::CaseStudyMatcher, Arc::new(EagerPanic));
        let state = executor(stages).execute(state(), None).await.unwrap();

        let errors = state.errors_for(StageName::CaseStudyMatcher);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("stage panicked"));
        assert!(errors[0].contains("index out of bounds"));
        assert_eq!(state.status_of(StageName::CaseStudyMatcher), StageStatus::Failed);
        assert_eq!(state.status_of(StageName::ProposalBuilder), StageStatus::Succeeded);
        assert_eq!(state.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_stage_timeout_recorded() {
        let stages = happy_stages().with(
            StageName::DiscoveryQuestion,
            Fake::slow(PartialUpdate::new(), Duration::from_secs(5)),
        );
        let state = executor(stages)
            .with_stage_timeout(Duration::from_millis(50))
            .execute(state(), None)
            .await
            .unwrap();

        assert_eq!(state.status_of(StageName::DiscoveryQuestion), StageStatus::TimedOut);
        assert_eq!(state.errors_for(StageName::DiscoveryQuestion).len(), 1);
        assert!(state.discovery_questions.is_none());
        assert_eq!(state.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_deadline_abandons_outstanding_stages() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let stages = happy_stages().with(
            StageName::CaseStudyMatcher,
            Fake::slow(PartialUpdate::new(), Duration::from_secs(5)),
        );
        let state = DagExecutor::new(GraphDefinition::presales().unwrap(), stages, bus)
            .unwrap()
            .with_run_deadline(Some(Duration::from_millis(200)))
            .execute(state(), None)
            .await
            .unwrap();

        assert_eq!(state.status_of(StageName::CaseStudyMatcher), StageStatus::Abandoned);
        assert_eq!(state.log_count(StageName::CaseStudyMatcher), 1);
        assert_eq!(state.status_of(StageName::ProposalBuilder), StageStatus::Abandoned);
        assert_eq!(state.log_count(StageName::ProposalBuilder), 0);
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].contains("deadline"));
        assert_eq!(state.status_of(StageName::ValueProposition), StageStatus::Succeeded);

        let mut saw_deadline = false;
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::RunDeadlineExceeded { abandoned, .. } = event {
                assert!(abandoned.contains(&StageName::ProposalBuilder));
                saw_deadline = true;
            }
        }
        assert!(saw_deadline);
    }

    #[tokio::test]
    async fn test_disabled_stages_skip_without_calling_adapter() {
        let proposal = Fake::ok(PartialUpdate::new());
        let stages = happy_stages().with(StageName::ProposalBuilder, proposal.clone());
        let selection = TaskSelection::all().without(StageName::ProposalBuilder);

        let state = executor(stages)
            .execute(state().with_selection(&selection), None)
            .await
            .unwrap();

        assert!(proposal.seen.lock().is_empty());
        assert_eq!(state.status_of(StageName::ProposalBuilder), StageStatus::Skipped);
        assert_eq!(state.proposal_draft, Some(Default::default()));
        assert!(state.errors.is_empty());
    }

    #[tokio::test]
    async fn test_empty_source_text_fails_before_any_stage() {
        let analyzer = Fake::ok(PartialUpdate::new());
        let stages = happy_stages().with(StageName::RfpAnalyzer, analyzer.clone());
        let empty = WorkflowState::new(RunId::from_str("x"), ProjectId(1), DocumentId(1), " ");

        let err = executor(stages).execute(empty, None).await.unwrap_err();
        assert!(err.is_precondition());
        assert!(analyzer.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_progress_snapshots_published() {
        struct Count(Mutex<Vec<RunStatus>>);
        impl ProgressSink for Count {
            fn publish(&self, snapshot: &WorkflowState) {
                self.0.lock().push(snapshot.status);
            }
        }

        let sink = Count(Mutex::new(vec![]));
        executor(happy_stages())
            .execute(state(), Some(&sink))
            .await
            .unwrap();

        let seen = sink.0.lock();
        assert!(seen.len() > 2);
        assert!(seen.iter().all(|s| *s == RunStatus::Running));
    }

    #[tokio::test]
    async fn test_custom_merge_policy_sees_every_outcome() {
        struct Recording(Mutex<Vec<StageName>>);
        impl MergePolicy for Recording {
            fn merge(&self, state: &mut WorkflowState, outcome: StageOutcome) {
                self.0.lock().push(outcome.stage);
                DefaultMergePolicy.merge(state, outcome);
            }
        }

        let policy = Arc::new(Recording(Mutex::new(vec![])));
        let selection = TaskSelection::all().without(StageName::CaseStudyMatcher);
        let state = executor(happy_stages())
            .with_merge_policy(policy.clone())
            .execute(state().with_selection(&selection), None)
            .await
            .unwrap();

        let merged = policy.0.lock();
        assert_eq!(merged.len(), 6);
        assert_eq!(merged.first(), Some(&StageName::RfpAnalyzer));
        assert_eq!(merged.last(), Some(&StageName::ProposalBuilder));
        assert_eq!(state.status_of(StageName::CaseStudyMatcher), StageStatus::Skipped);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
