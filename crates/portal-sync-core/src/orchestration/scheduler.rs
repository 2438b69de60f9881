use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SchedulerConfig;
use crate::models::{CoreResult, RecoveryReport};
use crate::orchestration::executor::TaskExecutor;
use crate::persistence::run_blocking;

#[derive(Default)]
struct SchedulerState {
    running: AtomicBool,
    poll_loop: Mutex<Option<PollLoop>>,
}

/// One started poll loop. The stop signal belongs to this loop only, so a
/// permit left by an earlier shutdown never reaches a later start.
struct PollLoop {
    handle: JoinHandle<()>,
    stop: Arc<Notify>,
}

/// Time trigger for every task. One poll loop per instance; dispatched runs
/// are tracked by the executor's detached-task set.
#[derive(Clone)]
pub struct Scheduler {
    executor: TaskExecutor,
    config: SchedulerConfig,
    state: Arc<SchedulerState>,
}

impl Scheduler {
    pub fn new(executor: TaskExecutor, config: SchedulerConfig) -> Self {
        Self {
            executor,
            config,
            state: Arc::new(SchedulerState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Recovers runs interrupted by a previous process, then starts polling.
    /// Returns `None` when scheduling is disabled or already started.
    pub async fn initialize(&self) -> CoreResult<Option<RecoveryReport>> {
        if !self.config.enabled {
            tracing::info!(
                is_production = self.config.is_production,
                "task scheduler disabled; set PORTAL_SYNC_ENABLED=true to enable"
            );
            return Ok(None);
        }
        if self.state.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("task scheduler already running");
            return Ok(None);
        }

        let now = OffsetDateTime::now_utc();
        let report = match run_blocking(self.executor.store(), "recover_interrupted", move |store| {
            store.recover_interrupted(now)
        })
        .await
        {
            Ok(report) => report,
            Err(error) => {
                self.state.running.store(false, Ordering::SeqCst);
                return Err(error);
            }
        };

        if report.is_empty() {
            tracing::debug!("no interrupted task runs to recover");
        } else {
            let failed_tasks: Vec<&str> = report
                .failed_tasks
                .iter()
                .map(|kind| kind.as_str())
                .collect();
            tracing::warn!(
                cancelled_runs = report.cancelled_runs,
                failed_tasks = ?failed_tasks,
                "recovered task runs interrupted by process restart"
            );
        }

        let executor = self.executor.clone();
        let stop = Arc::new(Notify::new());
        let check_interval = self.config.check_interval();
        {
            let mut poll_loop_slot = self.lock_poll_loop();
            // A shutdown that landed during recovery wins.
            if !self.state.running.load(Ordering::SeqCst) {
                return Ok(Some(report));
            }
            let handle = tokio::spawn(poll_loop(executor, stop.clone(), check_interval));
            *poll_loop_slot = Some(PollLoop { handle, stop });
        }

        tracing::info!(
            check_interval_seconds = self.config.check_interval_seconds,
            "task scheduler started"
        );
        Ok(Some(report))
    }

    /// One scheduling pass. Returns how many due tasks were dispatched.
    pub async fn poll_once(&self) -> usize {
        poll_due_tasks(&self.executor).await
    }

    /// Stops polling and waits up to `grace` for dispatched work. Returns the
    /// number of detached tasks aborted when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let was_running = self.state.running.swap(false, Ordering::SeqCst);

        let poll_loop = self.lock_poll_loop().take();
        if let Some(PollLoop { handle, stop }) = poll_loop {
            stop.notify_one();
            if let Err(join_error) = handle.await
                && join_error.is_panic()
            {
                tracing::error!(error = %join_error, "scheduler poll loop panicked");
            }
        }

        let aborted = self.executor.detached().drain(grace).await;
        if was_running {
            tracing::info!(aborted, "task scheduler stopped");
        }
        aborted
    }

    fn lock_poll_loop(&self) -> std::sync::MutexGuard<'_, Option<PollLoop>> {
        self.state
            .poll_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn poll_loop(executor: TaskExecutor, stop: Arc<Notify>, check_interval: Duration) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = ticker.tick() => {
                poll_due_tasks(&executor).await;
            }
        }
    }
    tracing::debug!("scheduler poll loop exited");
}

async fn poll_due_tasks(executor: &TaskExecutor) -> usize {
    let now = OffsetDateTime::now_utc();
    let due = match run_blocking(executor.store(), "due_tasks", move |store| {
        store.due_tasks(now)
    })
    .await
    {
        Ok(due) => due,
        Err(error) => {
            tracing::error!(message = %error.message, "failed to load due tasks");
            return 0;
        }
    };

    let mut dispatched = 0;
    for definition in due {
        let kind = definition.kind;
        // Claimed here so the next tick cannot dispatch the same kind again.
        let Ok(guard) = executor.acquire(kind) else {
            tracing::debug!(task_type = %kind, "task still running; skipping this poll");
            continue;
        };

        let task_executor = executor.clone();
        executor.detached().spawn("scheduled_task", async move {
            if let Err(error) = task_executor.run_acquired(guard, definition).await {
                tracing::debug!(
                    task_type = %kind,
                    kind = ?error.kind,
                    "scheduled task run returned an error"
                );
            }
        });
        dispatched += 1;
        tracing::debug!(task_type = %kind, "dispatched due task");
    }
    dispatched
}
