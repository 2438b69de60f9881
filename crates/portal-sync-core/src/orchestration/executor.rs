use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::json;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::config::SchedulerConfig;
use crate::models::{
    ChainRun, CoreError, CoreErrorKind, CoreResult, NewTaskRun, RunCompletion, RunStatus,
    SyncMode, SyncWindow, TaskConfig, TaskDefinition, TaskKind,
};
use crate::orchestration::adapters::{AdapterRegistry, AlertSink, TaskInvocation, TaskOutcome};
use crate::orchestration::chain::{ChainOptions, ChainOrchestrator, ChainPlan};
use crate::orchestration::detached::DetachedTasks;
use crate::orchestration::registry::{ProgressReporter, RunningTaskGuard, RunningTaskRegistry};
use crate::orchestration::sync_context::{SyncContext, SyncContextRegistry};
use crate::persistence::{TaskStore, run_blocking};
use crate::schedule::{next_run_at, retry_at};
use crate::sync_policy::resolve_sync_window;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExecutorSettings {
    pub schedule_offset: UtcOffset,
    pub max_incremental_age: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            schedule_offset: UtcOffset::UTC,
            max_incremental_age: Duration::days(7),
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &SchedulerConfig) -> CoreResult<Self> {
        Ok(Self {
            schedule_offset: config.schedule_offset()?,
            max_incremental_age: config.max_incremental_age(),
        })
    }
}

/// Result of a lifecycle body as it is written to the run history.
pub trait LifecycleOutput: Send + Sync + 'static {
    fn records_processed(&self) -> u64;

    fn summary(&self) -> serde_json::Value;

    /// A body may complete and still report a failure, such as a chain whose
    /// required step failed. The summary is persisted either way.
    fn failure(&self) -> Option<CoreError> {
        None
    }
}

impl LifecycleOutput for TaskOutcome {
    fn records_processed(&self) -> u64 {
        self.records_processed
    }

    fn summary(&self) -> serde_json::Value {
        self.summary.clone()
    }
}

impl LifecycleOutput for ChainRun {
    fn records_processed(&self) -> u64 {
        ChainRun::records_processed(self)
    }

    fn summary(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "chain_id": self.chain_id }))
    }

    fn failure(&self) -> Option<CoreError> {
        ChainRun::failure(self)
    }
}

/// Handed to a lifecycle body.
pub struct LifecycleScope {
    pub definition: TaskDefinition,
    pub progress: ProgressReporter,
    pub started_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    adapters: Arc<AdapterRegistry>,
    registry: RunningTaskRegistry,
    contexts: SyncContextRegistry,
    detached: DetachedTasks,
    alert_sink: Option<Arc<dyn AlertSink>>,
    alerts_enabled: Arc<AtomicBool>,
    chain_plan: Arc<ChainPlan>,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        adapters: AdapterRegistry,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            adapters: Arc::new(adapters),
            registry: RunningTaskRegistry::new(),
            contexts: SyncContextRegistry::new(),
            detached: DetachedTasks::new(),
            alert_sink: None,
            alerts_enabled: Arc::new(AtomicBool::new(false)),
            chain_plan: Arc::new(ChainPlan::daily_sync()),
            settings,
        }
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>, enabled: bool) -> Self {
        self.alert_sink = Some(sink);
        self.alerts_enabled.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn with_chain_plan(mut self, plan: ChainPlan) -> CoreResult<Self> {
        plan.validate()?;
        self.chain_plan = Arc::new(plan);
        Ok(self)
    }

    pub fn with_detached_tasks(mut self, detached: DetachedTasks) -> Self {
        self.detached = detached;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &RunningTaskRegistry {
        &self.registry
    }

    pub fn contexts(&self) -> &SyncContextRegistry {
        &self.contexts
    }

    pub fn detached(&self) -> &DetachedTasks {
        &self.detached
    }

    pub fn chain_plan(&self) -> &ChainPlan {
        &self.chain_plan
    }

    pub fn settings(&self) -> ExecutorSettings {
        self.settings
    }

    pub fn alerts_enabled(&self) -> bool {
        self.alert_sink.is_some() && self.alerts_enabled.load(Ordering::SeqCst)
    }

    pub fn set_alerts_enabled(&self, enabled: bool) {
        self.alerts_enabled.store(enabled, Ordering::SeqCst);
    }

    pub async fn load_definition(&self, kind: TaskKind) -> CoreResult<TaskDefinition> {
        run_blocking(&self.store, "get_task", move |store| store.get_task(kind))
            .await?
            .ok_or_else(|| CoreError::not_found(kind))
    }

    /// Adapter kinds a run of `kind` needs but this executor lacks. For the
    /// chain only required steps count.
    pub fn missing_adapters(&self, kind: TaskKind) -> Vec<TaskKind> {
        match kind {
            TaskKind::HistoryCleanup => Vec::new(),
            TaskKind::DailySyncChain => self
                .chain_plan
                .all_steps()
                .filter(|step| step.required && !self.adapters.has_adapter(step.kind))
                .map(|step| step.kind)
                .collect(),
            _ if self.adapters.has_adapter(kind) => Vec::new(),
            _ => vec![kind],
        }
    }

    /// Claims the mutex for `kind` without touching the store.
    pub fn acquire(&self, kind: TaskKind) -> CoreResult<RunningTaskGuard> {
        self.registry
            .try_register(kind, OffsetDateTime::now_utc())
            .inspect_err(|_| {
                tracing::debug!(task_type = %kind, "task already running; rejecting run");
            })
    }

    pub async fn run_task(&self, definition: TaskDefinition) -> CoreResult<TaskOutcome> {
        let guard = self.acquire(definition.kind)?;
        self.run_acquired(guard, definition).await
    }

    /// Runs a task whose mutex the caller already holds.
    pub async fn run_acquired(
        &self,
        guard: RunningTaskGuard,
        definition: TaskDefinition,
    ) -> CoreResult<TaskOutcome> {
        match definition.kind {
            TaskKind::DailySyncChain => {
                let options = ChainOptions::from_config(&definition.config);
                let run = self
                    .run_chain_acquired(guard, definition, options)
                    .await?
                    .into_result()?;
                Ok(TaskOutcome::new(
                    run.records_processed(),
                    LifecycleOutput::summary(&run),
                ))
            }
            TaskKind::HistoryCleanup => {
                let executor = self.clone();
                self.run_with_lifecycle(guard, definition, move |scope| async move {
                    executor.prune_history(scope).await
                })
                .await
            }
            _ => {
                let executor = self.clone();
                self.run_with_lifecycle(guard, definition, move |scope| async move {
                    executor.invoke_adapter(scope, None, false).await
                })
                .await
            }
        }
    }

    /// Runs one chain step under its own mutex and history row, sharing the
    /// chain's sync context with the adapter.
    pub async fn run_chain_step(
        &self,
        guard: RunningTaskGuard,
        definition: TaskDefinition,
        context: Arc<SyncContext>,
        force_full: bool,
    ) -> CoreResult<TaskOutcome> {
        if definition.kind.is_builtin() {
            return Err(CoreError::for_task(
                definition.kind,
                CoreErrorKind::InvalidInput,
                format!("task '{}' cannot run as a chain step", definition.kind),
            ));
        }
        let executor = self.clone();
        self.run_with_lifecycle(guard, definition, move |scope| async move {
            executor.invoke_adapter(scope, Some(context), force_full).await
        })
        .await
    }

    /// Runs the chain under a mutex the caller already holds. A chain whose
    /// required step failed comes back as `Ok` with a failed status; see
    /// [`ChainRun::into_result`].
    pub async fn run_chain_acquired(
        &self,
        guard: RunningTaskGuard,
        definition: TaskDefinition,
        options: ChainOptions,
    ) -> CoreResult<ChainRun> {
        if definition.kind != TaskKind::DailySyncChain {
            return Err(CoreError::for_task(
                definition.kind,
                CoreErrorKind::InvalidInput,
                format!("task '{}' is not a chain", definition.kind),
            ));
        }
        let orchestrator =
            ChainOrchestrator::new(self.clone(), self.chain_plan.clone(), options);
        self.run_with_lifecycle(guard, definition, move |scope| async move {
            Ok(orchestrator.run(Some(scope.progress)).await)
        })
        .await
    }

    /// Persists running → {success, failed} around `body`. The mutex held by
    /// `guard` is released when this returns, on every path.
    ///
    /// An output whose [`LifecycleOutput::failure`] is set is recorded as
    /// failed and still returned, so the caller keeps the full record. A store
    /// error while recording success settles the run as failed.
    pub async fn run_with_lifecycle<T, F, Fut>(
        &self,
        guard: RunningTaskGuard,
        definition: TaskDefinition,
        body: F,
    ) -> CoreResult<T>
    where
        T: LifecycleOutput,
        F: FnOnce(LifecycleScope) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let kind = definition.kind;
        let started = Instant::now();
        let started_at = OffsetDateTime::now_utc();

        run_blocking(&self.store, "mark_task_running", move |store| {
            store.mark_task_running(kind, started_at)
        })
        .await
        .map_err(|error| error.with_task(kind))?;

        let new_run = NewTaskRun {
            task_id: definition.id,
            kind,
            started_at,
        };
        let history_id =
            match run_blocking(&self.store, "insert_run", move |store| store.insert_run(&new_run))
                .await
            {
                Ok(id) => id,
                Err(error) => {
                    let error = error.with_task(kind);
                    self.persist_failure(&definition, None, &error, started, None::<&T>)
                        .await;
                    return Err(error);
                }
            };

        tracing::info!(
            task_type = %kind,
            history_id,
            "task started"
        );

        let scope = LifecycleScope {
            progress: self.registry.reporter(&guard),
            definition: definition.clone(),
            started_at,
        };

        let result = body(scope).await;
        let outcome = match result {
            Ok(output) => match output.failure() {
                None => match self
                    .persist_success(&definition, history_id, &output, started)
                    .await
                {
                    Ok(()) => Ok(output),
                    // The run must not stay `running`; settle it as failed instead.
                    Err(error) => {
                        let error = error.with_task(kind);
                        self.persist_failure(
                            &definition,
                            Some(history_id),
                            &error,
                            started,
                            Some(&output),
                        )
                        .await;
                        Err(error)
                    }
                },
                Some(error) => {
                    let error = classify_failure(kind, error);
                    self.persist_failure(
                        &definition,
                        Some(history_id),
                        &error,
                        started,
                        Some(&output),
                    )
                    .await;
                    Ok(output)
                }
            },
            Err(error) => {
                let error = classify_failure(kind, error);
                self.persist_failure(&definition, Some(history_id), &error, started, None::<&T>)
                    .await;
                Err(error)
            }
        };

        drop(guard);
        outcome
    }

    async fn persist_success<T: LifecycleOutput>(
        &self,
        definition: &TaskDefinition,
        history_id: i64,
        output: &T,
        started: Instant,
    ) -> CoreResult<()> {
        let kind = definition.kind;
        let duration_seconds = started.elapsed().as_secs_f64();
        let completed_at = OffsetDateTime::now_utc();
        let next = next_run_at(&definition.schedule, completed_at, self.settings.schedule_offset);
        let records_processed = output.records_processed();

        run_blocking(&self.store, "record_task_success", move |store| {
            store.record_task_success(kind, duration_seconds, next)
        })
        .await
        .map_err(|error| error.with_task(kind))?;

        let completion = RunCompletion {
            status: RunStatus::Success,
            completed_at,
            duration_seconds,
            records_processed,
            result_summary: Some(output.summary()),
            error_message: None,
        };
        run_blocking(&self.store, "complete_run", move |store| {
            store.complete_run(history_id, &completion)
        })
        .await
        .map_err(|error| error.with_task(kind))?;

        tracing::info!(
            task_type = %kind,
            history_id,
            records_processed,
            duration_seconds,
            next_run_at = %next,
            "task completed"
        );
        Ok(())
    }

    async fn persist_failure<T: LifecycleOutput>(
        &self,
        definition: &TaskDefinition,
        history_id: Option<i64>,
        error: &CoreError,
        started: Instant,
        output: Option<&T>,
    ) {
        let kind = definition.kind;
        let duration_seconds = started.elapsed().as_secs_f64();
        let completed_at = OffsetDateTime::now_utc();
        let retry = retry_at(&definition.schedule, completed_at);
        let message = error.message.clone();

        tracing::error!(
            task_type = %kind,
            history_id,
            kind = ?error.kind,
            message = %error.message,
            duration_seconds,
            retry_at = %retry,
            "task failed"
        );

        let failure_message = message.clone();
        if let Err(store_error) = run_blocking(&self.store, "record_task_failure", move |store| {
            store.record_task_failure(kind, &failure_message, duration_seconds, retry)
        })
        .await
        {
            tracing::error!(
                task_type = %kind,
                message = %store_error.message,
                "failed to persist task failure"
            );
        }

        if let Some(history_id) = history_id {
            let completion = RunCompletion {
                status: RunStatus::Failed,
                completed_at,
                duration_seconds,
                records_processed: output.map(LifecycleOutput::records_processed).unwrap_or(0),
                result_summary: output.map(LifecycleOutput::summary),
                error_message: Some(message.clone()),
            };
            if let Err(store_error) = run_blocking(&self.store, "complete_run", move |store| {
                store.complete_run(history_id, &completion)
            })
            .await
            {
                tracing::error!(
                    task_type = %kind,
                    history_id,
                    message = %store_error.message,
                    "failed to persist run history failure"
                );
            }
        }

        self.emit_alert(definition.name.clone(), message, duration_seconds);
    }

    fn emit_alert(&self, task_name: String, error_message: String, duration_seconds: f64) {
        if !self.alerts_enabled() {
            return;
        }
        let Some(sink) = self.alert_sink.clone() else {
            return;
        };
        self.detached.spawn("sync_error_alert", async move {
            if let Err(error) = sink
                .send_sync_error_alert(&task_name, &error_message, duration_seconds)
                .await
            {
                tracing::warn!(
                    task_name = %task_name,
                    message = %error.message,
                    "failed to send sync error alert"
                );
            }
        });
    }

    async fn invoke_adapter(
        &self,
        scope: LifecycleScope,
        context: Option<Arc<SyncContext>>,
        force_full: bool,
    ) -> CoreResult<TaskOutcome> {
        let kind = scope.definition.kind;
        let adapter = self.adapters.get(kind).ok_or_else(|| {
            CoreError::for_task(
                kind,
                CoreErrorKind::ExecutorFailure,
                format!("no adapter is registered for task '{kind}'"),
            )
        })?;

        let window = self.sync_window(&scope, force_full).await?;
        tracing::debug!(
            task_type = %kind,
            mode = ?window.mode,
            since = ?window.since,
            chain_id = context.as_deref().map(SyncContext::chain_id),
            "invoking sync adapter"
        );

        let invocation = TaskInvocation {
            kind,
            config: scope.definition.config,
            window,
            progress: scope.progress,
            context,
        };

        // Own task so an adapter panic surfaces as a failed run.
        tokio::spawn(async move { adapter.execute(invocation).await })
            .await
            .map_err(|join_error| {
                CoreError::for_task(
                    kind,
                    CoreErrorKind::ExecutorFailure,
                    format!("sync adapter for '{kind}' terminated abnormally: {join_error}"),
                )
            })?
    }

    async fn sync_window(
        &self,
        scope: &LifecycleScope,
        force_full: bool,
    ) -> CoreResult<SyncWindow> {
        let requested = match scope.definition.config.sync_mode() {
            _ if force_full => SyncMode::Full,
            Some(mode) => mode,
            None => return Ok(SyncWindow::full()),
        };
        if requested == SyncMode::Full {
            return Ok(SyncWindow::full());
        }

        let kind = scope.definition.kind;
        let watermark = run_blocking(&self.store, "last_success_at", move |store| {
            store.last_success_at(kind)
        })
        .await?;
        Ok(resolve_sync_window(
            requested,
            watermark,
            scope.started_at,
            self.settings.max_incremental_age,
        ))
    }

    async fn prune_history(&self, scope: LifecycleScope) -> CoreResult<TaskOutcome> {
        let max_age_days = match &scope.definition.config {
            TaskConfig::HistoryCleanup(config) => config.max_age_days,
            _ => {
                return Err(CoreError::for_task(
                    scope.definition.kind,
                    CoreErrorKind::ExecutorFailure,
                    "history cleanup requires a maxAgeDays config",
                ));
            }
        };
        let older_than = scope.started_at - Duration::days(i64::from(max_age_days.max(1)));
        scope.progress.report("pruning", 0, 1, None);
        let deleted = run_blocking(&self.store, "prune_history", move |store| {
            store.prune_history(older_than)
        })
        .await?;
        scope.progress.report("pruning", 1, 1, None);

        let deleted = u64::try_from(deleted).unwrap_or(u64::MAX);
        Ok(TaskOutcome::new(
            deleted,
            json!({ "deleted": deleted, "max_age_days": max_age_days }),
        ))
    }
}

fn classify_failure(kind: TaskKind, error: CoreError) -> CoreError {
    let error = error.with_task(kind);
    match error.kind {
        CoreErrorKind::StepFailure | CoreErrorKind::StorageFailure => error,
        _ => CoreError {
            kind: CoreErrorKind::ExecutorFailure,
            ..error
        },
    }
}
