use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::models::{CoreError, CoreResult, TaskKind, TaskProgress};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunningTask {
    #[serde(rename = "task_type")]
    pub kind: TaskKind,
    #[serde(skip)]
    pub run_token: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub progress: TaskProgress,
}

/// Process-local map of in-flight task types. Key presence is the mutex;
/// entries are only removed by dropping the [`RunningTaskGuard`].
#[derive(Clone, Default)]
pub struct RunningTaskRegistry {
    inner: Arc<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    next_token: AtomicU64,
    running: Mutex<HashMap<TaskKind, RunningTask>>,
}

impl RunningTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_register(
        &self,
        kind: TaskKind,
        started_at: OffsetDateTime,
    ) -> CoreResult<RunningTaskGuard> {
        let mut running = self.lock();
        if running.contains_key(&kind) {
            return Err(CoreError::mutex_violation(kind));
        }

        let run_token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        running.insert(
            kind,
            RunningTask {
                kind,
                run_token,
                started_at,
                progress: TaskProgress::starting(started_at),
            },
        );

        Ok(RunningTaskGuard {
            registry: self.clone(),
            kind,
            run_token,
        })
    }

    pub fn is_running(&self, kind: TaskKind) -> bool {
        self.lock().contains_key(&kind)
    }

    pub fn get(&self, kind: TaskKind) -> Option<RunningTask> {
        self.lock().get(&kind).cloned()
    }

    /// Running tasks ordered by start time.
    pub fn snapshot(&self) -> Vec<RunningTask> {
        let mut tasks: Vec<RunningTask> = self.lock().values().cloned().collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.kind.cmp(&b.kind)));
        tasks
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Updates the progress of whichever run currently holds `kind`.
    /// Returns false, changing nothing, when the kind is not running.
    pub fn update_progress(
        &self,
        kind: TaskKind,
        stage: impl Into<String>,
        current: u64,
        total: u64,
        details: Option<Value>,
    ) -> bool {
        self.apply_progress(kind, None, stage.into(), current, total, details)
    }

    pub fn reporter(&self, guard: &RunningTaskGuard) -> ProgressReporter {
        ProgressReporter {
            registry: self.clone(),
            kind: guard.kind,
            run_token: guard.run_token,
        }
    }

    fn apply_progress(
        &self,
        kind: TaskKind,
        run_token: Option<u64>,
        stage: String,
        current: u64,
        total: u64,
        details: Option<Value>,
    ) -> bool {
        let mut running = self.lock();
        let Some(entry) = running.get_mut(&kind) else {
            return false;
        };
        if run_token.is_some_and(|token| token != entry.run_token) {
            return false;
        }
        entry.progress = TaskProgress {
            stage,
            current,
            total,
            details,
            updated_at: OffsetDateTime::now_utc(),
        };
        true
    }

    fn release(&self, kind: TaskKind, run_token: u64) {
        let mut running = self.lock();
        if running
            .get(&kind)
            .is_some_and(|entry| entry.run_token == run_token)
        {
            running.remove(&kind);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskKind, RunningTask>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the mutex for one task type. Dropping it is the only release point.
#[must_use = "dropping the guard releases the task mutex immediately"]
pub struct RunningTaskGuard {
    registry: RunningTaskRegistry,
    kind: TaskKind,
    run_token: u64,
}

impl RunningTaskGuard {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

impl Drop for RunningTaskGuard {
    fn drop(&mut self) {
        self.registry.release(self.kind, self.run_token);
    }
}

/// Progress callback handed to adapters. Bound to a single run, so reports
/// arriving after that run released its mutex are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    registry: RunningTaskRegistry,
    kind: TaskKind,
    run_token: u64,
}

impl ProgressReporter {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn report(
        &self,
        stage: impl Into<String>,
        current: u64,
        total: u64,
        details: Option<Value>,
    ) -> bool {
        self.registry.apply_progress(
            self.kind,
            Some(self.run_token),
            stage.into(),
            current,
            total,
            details,
        )
    }
}
