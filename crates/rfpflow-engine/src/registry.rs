use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::RwLock;
use tracing::debug;

use rfpflow_core::config::RegistryConfig;
use rfpflow_core::state::WorkflowState;
use rfpflow_core::traits::ProgressSink;
use rfpflow_core::types::{ProjectId, RunId};

/// In-memory index of runs, keyed by run id, plus a latest-run-per-project
/// index.
///
/// Bounded: the least recently touched record is evicted once `capacity` is
/// reached, and records older than the TTL read as absent until the next
/// `register` purges them. Readers receive an `Arc` snapshot and never
/// observe a half-written record.
pub struct RunRegistry {
    inner: RwLock<Inner>,
    ttl: Option<Duration>,
}

struct Inner {
    runs: LruCache<RunId, Entry>,
    latest: HashMap<ProjectId, RunId>,
}

struct Entry {
    state: Arc<WorkflowState>,
    updated_at: Instant,
}

impl RunRegistry {
    pub fn new(capacity: NonZeroUsize, ttl: Option<Duration>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                runs: LruCache::new(capacity),
                latest: HashMap::new(),
            }),
            ttl,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self::new(capacity, config.ttl_secs.map(Duration::from_secs))
    }

    /// Record a new run and make it the project's latest. Expired records
    /// are purged first so they do not hold capacity.
    pub fn register(&self, state: &WorkflowState) {
        let mut inner = self.inner.write();
        if let Some(ttl) = self.ttl {
            inner.purge_expired(ttl);
        }
        inner.latest.insert(state.project_id, state.run_id.clone());
        inner.put(Arc::new(state.clone()));
        debug!(run_id = %state.run_id, project_id = %state.project_id, "Run registered");
    }

    /// Replace a run's snapshot. Does not change the latest-run index.
    pub fn update(&self, state: &WorkflowState) {
        self.store(Arc::new(state.clone()));
    }

    /// Replace the snapshot of a tracked run. A run that was evicted or
    /// expired stays gone; only `register` inserts.
    pub fn store(&self, state: Arc<WorkflowState>) -> bool {
        let mut inner = self.inner.write();
        match inner.runs.get_mut(&state.run_id) {
            Some(entry) => {
                entry.state = state;
                entry.updated_at = Instant::now();
                true
            }
            None => {
                debug!(run_id = %state.run_id, "Snapshot for untracked run dropped");
                false
            }
        }
    }

    pub fn get(&self, run_id: &RunId) -> Option<Arc<WorkflowState>> {
        let inner = self.inner.read();
        let entry = inner.runs.peek(run_id)?;
        if self.is_expired(entry) {
            return None;
        }
        Some(Arc::clone(&entry.state))
    }

    /// The most recently registered run for a project.
    pub fn latest_for_project(&self, project_id: ProjectId) -> Option<Arc<WorkflowState>> {
        let run_id = self.latest_run_id(project_id)?;
        self.get(&run_id)
    }

    pub fn latest_run_id(&self, project_id: ProjectId) -> Option<RunId> {
        self.inner.read().latest.get(&project_id).cloned()
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.ttl else { return 0 };
        self.inner.write().purge_expired(ttl)
    }

    pub fn len(&self) -> usize {
        self.inner.read().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.updated_at.elapsed() > ttl)
    }
}

impl Inner {
    fn purge_expired(&mut self, ttl: Duration) -> usize {
        let expired: Vec<RunId> = self
            .runs
            .iter()
            .filter(|(_, entry)| entry.updated_at.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for run_id in &expired {
            self.runs.pop(run_id);
        }
        let Inner { runs, latest } = self;
        latest.retain(|_, run_id| runs.contains(&*run_id));
        if !expired.is_empty() {
            debug!(count = expired.len(), "Purged expired runs");
        }
        expired.len()
    }

    fn put(&mut self, state: Arc<WorkflowState>) {
        let run_id = state.run_id.clone();
        let evicted = self.runs.push(
            run_id.clone(),
            Entry {
                state,
                updated_at: Instant::now(),
            },
        );
        if let Some((evicted_id, entry)) = evicted {
            if evicted_id != run_id {
                debug!(run_id = %evicted_id, "Run evicted from registry");
                let project_id = entry.state.project_id;
                if self.latest.get(&project_id) == Some(&evicted_id) {
                    self.latest.remove(&project_id);
                }
            }
        }
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default())
    }
}

impl ProgressSink for RunRegistry {
    fn publish(&self, snapshot: &WorkflowState) {
        self.update(snapshot);
    }
}
