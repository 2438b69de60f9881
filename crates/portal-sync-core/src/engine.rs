use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::catalog::default_task_definitions;
use crate::config::SchedulerConfig;
use crate::models::{
    ChainRun, CoreResult, RecoveryReport, TaskConfig, TaskDefinition, TaskKind,
    TaskProgress, TaskRunRecord, TaskSchedule, TaskSummary,
};
use crate::orchestration::{
    AdapterRegistry, AlertSink, ChainOptions, ChainPlan, ExecutorSettings, LogAlertSink,
    Scheduler, SyncAdapter, TaskExecutor, TaskOutcome,
};
use crate::persistence::{TaskStore, run_blocking};
use crate::schedule::{next_run_at, validate_schedule};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActiveTaskStatus {
    pub task_type: TaskKind,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub running_seconds: f64,
    pub progress: TaskProgress,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub is_production: bool,
    pub system_alerts_enabled: bool,
    pub active_tasks: Vec<ActiveTaskStatus>,
    pub check_interval_seconds: u64,
}

pub struct SyncEngineBuilder {
    store: Arc<dyn TaskStore>,
    config: SchedulerConfig,
    adapters: Vec<Arc<dyn SyncAdapter>>,
    alert_sink: Arc<dyn AlertSink>,
    chain_plan: Option<ChainPlan>,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn SyncAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = sink;
        self
    }

    pub fn chain_plan(mut self, plan: ChainPlan) -> Self {
        self.chain_plan = Some(plan);
        self
    }

    pub fn build(self) -> CoreResult<SyncEngine> {
        self.config.validate()?;
        let settings = ExecutorSettings::from_config(&self.config)?;
        let adapters = AdapterRegistry::new(self.adapters)?;

        let mut executor = TaskExecutor::new(self.store, adapters, settings)
            .with_alert_sink(self.alert_sink, self.config.system_alerts_enabled);
        if let Some(plan) = self.chain_plan {
            executor = executor.with_chain_plan(plan)?;
        }
        let scheduler = Scheduler::new(executor.clone(), self.config.clone());

        Ok(SyncEngine {
            executor,
            scheduler,
            config: self.config,
        })
    }
}

/// Owns the running-task registry, sync contexts and scheduler for one
/// process. Create one per store.
#[derive(Clone)]
pub struct SyncEngine {
    executor: TaskExecutor,
    scheduler: Scheduler,
    config: SchedulerConfig,
}

impl SyncEngine {
    pub fn builder(store: Arc<dyn TaskStore>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            config: SchedulerConfig::default(),
            adapters: Vec::new(),
            alert_sink: Arc::new(LogAlertSink),
            chain_plan: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Inserts the built-in catalog for kinds the store does not know yet.
    /// Returns how many definitions were added.
    pub async fn seed_default_tasks(&self) -> CoreResult<usize> {
        let now = OffsetDateTime::now_utc();
        let offset = self.executor.settings().schedule_offset;
        let definitions: Vec<TaskDefinition> = default_task_definitions()
            .into_iter()
            .map(|definition| {
                let next = definition
                    .enabled
                    .then(|| next_run_at(&definition.schedule, now, offset));
                definition.with_next_run_at(next)
            })
            .collect();

        let inserted = run_blocking(self.executor.store(), "seed_default_tasks", move |store| {
            let mut inserted = 0;
            for definition in &definitions {
                if store.ensure_task(definition)? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
        .await?;
        if inserted > 0 {
            tracing::info!(inserted, "seeded default task definitions");
        }
        Ok(inserted)
    }

    pub async fn initialize_scheduler(&self) -> CoreResult<Option<RecoveryReport>> {
        self.scheduler.initialize().await
    }

    /// Stops the scheduler and drains in-flight detached work within the
    /// configured grace period.
    pub async fn shutdown(&self) -> usize {
        self.scheduler.shutdown(self.config.shutdown_grace()).await
    }

    pub async fn get_all_tasks(&self) -> CoreResult<Vec<TaskSummary>> {
        run_blocking(self.executor.store(), "get_all_tasks", |store| {
            store.get_all_tasks()
        })
        .await
    }

    /// Enabled tasks whose scheduled runs would fail for want of an adapter,
    /// paired with the missing adapter kinds.
    pub async fn unbacked_enabled_tasks(&self) -> CoreResult<Vec<(TaskKind, Vec<TaskKind>)>> {
        let tasks = self.get_all_tasks().await?;
        Ok(tasks
            .into_iter()
            .filter(|summary| summary.definition.enabled)
            .filter_map(|summary| {
                let kind = summary.definition.kind;
                let missing = self.executor.missing_adapters(kind);
                (!missing.is_empty()).then_some((kind, missing))
            })
            .collect())
    }

    pub async fn get_task(&self, kind: TaskKind) -> CoreResult<Option<TaskDefinition>> {
        run_blocking(self.executor.store(), "get_task", move |store| store.get_task(kind)).await
    }

    pub async fn get_task_history(
        &self,
        kind: TaskKind,
        limit: usize,
    ) -> CoreResult<Vec<TaskRunRecord>> {
        run_blocking(self.executor.store(), "get_task_history", move |store| {
            store.get_task_history(kind, limit)
        })
        .await
    }

    pub async fn set_task_enabled(&self, kind: TaskKind, enabled: bool) -> CoreResult<()> {
        let now = OffsetDateTime::now_utc();
        run_blocking(self.executor.store(), "set_task_enabled", move |store| {
            store.set_task_enabled(kind, enabled, now)
        })
        .await?;
        tracing::info!(task_type = %kind, enabled, "task enablement changed");
        Ok(())
    }

    /// Validates `raw` against the config shape of `kind` before storing it.
    pub async fn update_task_config(&self, kind: TaskKind, raw: &Value) -> CoreResult<TaskConfig> {
        let config = TaskConfig::parse(kind, raw)?;
        let stored = config.clone();
        run_blocking(self.executor.store(), "update_task_config", move |store| {
            store.update_task_config(kind, &stored)
        })
        .await?;
        tracing::info!(task_type = %kind, "task config updated");
        Ok(config)
    }

    pub async fn update_task_schedule(
        &self,
        kind: TaskKind,
        schedule: TaskSchedule,
    ) -> CoreResult<Option<OffsetDateTime>> {
        validate_schedule(&schedule).map_err(|error| error.with_task(kind))?;
        let definition = self.executor.load_definition(kind).await?;
        let next = definition.enabled.then(|| {
            next_run_at(
                &schedule,
                OffsetDateTime::now_utc(),
                self.executor.settings().schedule_offset,
            )
        });
        run_blocking(self.executor.store(), "update_task_schedule", move |store| {
            store.update_task_schedule(kind, &schedule, next)
        })
        .await?;
        tracing::info!(task_type = %kind, next_run_at = ?next, "task schedule updated");
        Ok(next)
    }

    /// Starts a run in the background. The mutex is claimed before this
    /// returns, so a concurrent trigger of the same kind is rejected.
    pub async fn trigger_task(&self, kind: TaskKind) -> CoreResult<()> {
        let guard = self.executor.acquire(kind)?;
        let definition = self.executor.load_definition(kind).await?;

        let executor = self.executor.clone();
        self.executor.detached().spawn("manual_trigger", async move {
            if let Err(error) = executor.run_acquired(guard, definition).await {
                tracing::debug!(
                    task_type = %kind,
                    kind = ?error.kind,
                    "manually triggered run returned an error"
                );
            }
        });
        tracing::info!(task_type = %kind, "task triggered manually");
        Ok(())
    }

    /// Runs a task to completion on the caller's task. A kind that is already
    /// running is rejected before the store is read.
    pub async fn run_task_now(&self, kind: TaskKind) -> CoreResult<TaskOutcome> {
        let guard = self.executor.acquire(kind)?;
        let definition = self.executor.load_definition(kind).await?;
        self.executor.run_acquired(guard, definition).await
    }

    pub async fn run_daily_sync_chain(&self, options: ChainOptions) -> CoreResult<ChainRun> {
        let guard = self.executor.acquire(TaskKind::DailySyncChain)?;
        let definition = self.executor.load_definition(TaskKind::DailySyncChain).await?;
        self.executor
            .run_chain_acquired(guard, definition, options)
            .await
    }

    pub fn get_scheduler_status(&self) -> SchedulerStatus {
        let now = OffsetDateTime::now_utc();
        let active_tasks = self
            .executor
            .registry()
            .snapshot()
            .into_iter()
            .map(|task| ActiveTaskStatus {
                task_type: task.kind,
                started_at: task.started_at,
                running_seconds: (now - task.started_at).as_seconds_f64().max(0.0),
                progress: task.progress,
            })
            .collect();

        SchedulerStatus {
            running: self.scheduler.is_running(),
            is_production: self.config.is_production,
            system_alerts_enabled: self.executor.alerts_enabled(),
            active_tasks,
            check_interval_seconds: self.config.check_interval_seconds,
        }
    }

    pub fn set_system_alerts_enabled(&self, enabled: bool) {
        self.executor.set_alerts_enabled(enabled);
        tracing::info!(enabled, "system alerts toggled");
    }

    pub fn update_progress(
        &self,
        kind: TaskKind,
        stage: impl Into<String>,
        current: u64,
        total: u64,
        details: Option<Value>,
    ) -> bool {
        self.executor
            .registry()
            .update_progress(kind, stage, current, total, details)
    }
}
