use std::sync::Arc;

use time::OffsetDateTime;

use crate::models::{
    CoreError, CoreErrorKind, NewTaskRun, RecoveryReport, RunCompletion, TaskConfig,
    TaskDefinition, TaskKind, TaskRunRecord, TaskSchedule, TaskSummary,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Task catalog and append-only run history. Every method is one
/// independent statement; callers must not assume multi-statement atomicity.
pub trait TaskStore: Send + Sync {
    /// Inserts the definition unless a row for its task type exists.
    /// Returns whether a row was inserted.
    fn ensure_task(&self, definition: &TaskDefinition) -> PersistenceResult<bool>;

    fn get_all_tasks(&self) -> PersistenceResult<Vec<TaskSummary>>;

    fn get_task(&self, kind: TaskKind) -> PersistenceResult<Option<TaskDefinition>>;

    fn set_task_enabled(
        &self,
        kind: TaskKind,
        enabled: bool,
        now: OffsetDateTime,
    ) -> PersistenceResult<()>;

    fn update_task_config(&self, kind: TaskKind, config: &TaskConfig) -> PersistenceResult<()>;

    fn update_task_schedule(
        &self,
        kind: TaskKind,
        schedule: &TaskSchedule,
        next_run_at: Option<OffsetDateTime>,
    ) -> PersistenceResult<()>;

    /// Enabled tasks whose `next_run_at` is unset or not after `now`,
    /// earliest first.
    fn due_tasks(&self, now: OffsetDateTime) -> PersistenceResult<Vec<TaskDefinition>>;

    fn mark_task_running(&self, kind: TaskKind, now: OffsetDateTime) -> PersistenceResult<()>;

    fn record_task_success(
        &self,
        kind: TaskKind,
        duration_seconds: f64,
        next_run_at: OffsetDateTime,
    ) -> PersistenceResult<()>;

    fn record_task_failure(
        &self,
        kind: TaskKind,
        error_message: &str,
        duration_seconds: f64,
        next_run_at: OffsetDateTime,
    ) -> PersistenceResult<()>;

    fn insert_run(&self, run: &NewTaskRun) -> PersistenceResult<i64>;

    /// Applies the terminal update to a running history row. Returns false
    /// when the row was already terminal.
    fn complete_run(&self, run_id: i64, completion: &RunCompletion) -> PersistenceResult<bool>;

    fn get_task_history(
        &self,
        kind: TaskKind,
        limit: usize,
    ) -> PersistenceResult<Vec<TaskRunRecord>>;

    /// Start time of the most recent successful run, the incremental watermark.
    fn last_success_at(&self, kind: TaskKind) -> PersistenceResult<Option<OffsetDateTime>>;

    /// Reclassifies rows left `running` by a previous process.
    fn recover_interrupted(&self, now: OffsetDateTime) -> PersistenceResult<RecoveryReport>;

    /// Deletes terminal history rows started before `older_than`.
    fn prune_history(&self, older_than: OffsetDateTime) -> PersistenceResult<usize>;
}

/// Runs a synchronous store operation off the async worker threads.
pub async fn run_blocking<T, F>(
    store: &Arc<dyn TaskStore>,
    operation_name: &'static str,
    operation: F,
) -> PersistenceResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn TaskStore) -> PersistenceResult<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || operation(store.as_ref()))
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("task store '{operation_name}' join failure: {join_error}"),
            )
        })?
}
