use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use portal_sync_core::models::{
    CoreError, CoreErrorKind, CoreResult, NewTaskRun, RunStatus, TaskKind, TaskStatus,
};
use portal_sync_core::orchestration::{SyncAdapter, TaskInvocation, TaskOutcome};
use portal_sync_core::persistence::TaskStore;
use portal_sync_core::sqlite::SqliteStore;
use portal_sync_core::{SchedulerConfig, SyncEngine};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::Notify;

enum AdapterBehavior {
    Succeeds,
    Fails,
    WaitsFor(Arc<Notify>),
}

struct TestAdapter {
    kind: TaskKind,
    behavior: AdapterBehavior,
    calls: Arc<AtomicUsize>,
}

impl TestAdapter {
    fn new(kind: TaskKind, behavior: AdapterBehavior) -> Self {
        Self {
            kind,
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl SyncAdapter for TestAdapter {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn execute(&self, _invocation: TaskInvocation) -> CoreResult<TaskOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            AdapterBehavior::Succeeds => Ok(TaskOutcome::new(1, json!({}))),
            AdapterBehavior::Fails => Err(CoreError::new(
                CoreErrorKind::Internal,
                "simulated sync failure",
            )),
            AdapterBehavior::WaitsFor(release) => {
                release.notified().await;
                Ok(TaskOutcome::new(1, json!({})))
            }
        }
    }
}

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("portal-sync-{test_name}-{nanos}.sqlite3"))
}

fn enabled_config() -> SchedulerConfig {
    SchedulerConfig {
        enabled: true,
        check_interval_seconds: 3600,
        ..SchedulerConfig::default()
    }
}

async fn seeded_engine(
    path: &Path,
    config: SchedulerConfig,
    adapter: Arc<TestAdapter>,
) -> (Arc<SqliteStore>, SyncEngine) {
    let store = Arc::new(SqliteStore::new(path));
    store.migrate_to_latest().unwrap();
    let engine = SyncEngine::builder(store.clone())
        .config(config)
        .adapter(adapter)
        .build()
        .unwrap();
    engine.seed_default_tasks().await.unwrap();
    (store, engine)
}

/// Leaves a task and its history row as a killed process would.
fn simulate_interrupted_run(store: &SqliteStore, kind: TaskKind) -> i64 {
    let started = OffsetDateTime::now_utc() - time::Duration::minutes(3);
    let task_id = store.get_task(kind).unwrap().unwrap().id;
    store.mark_task_running(kind, started).unwrap();
    store
        .insert_run(&NewTaskRun {
            task_id,
            kind,
            started_at: started,
        })
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn disabled_scheduler_does_not_recover_or_poll() {
    let path = test_db_path("scheduler-disabled");
    let adapter = Arc::new(TestAdapter::new(TaskKind::SyncUsers, AdapterBehavior::Succeeds));
    let (store, engine) = seeded_engine(&path, SchedulerConfig::default(), adapter.clone()).await;
    store
        .set_task_enabled(TaskKind::SyncUsers, true, OffsetDateTime::now_utc())
        .unwrap();
    simulate_interrupted_run(&store, TaskKind::SyncUsers);

    assert!(engine.initialize_scheduler().await.unwrap().is_none());
    assert!(!engine.get_scheduler_status().running);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    let definition = store.get_task(TaskKind::SyncUsers).unwrap().unwrap();
    assert_eq!(definition.last_status, TaskStatus::Running);
    let history = store.get_task_history(TaskKind::SyncUsers, 10).unwrap();
    assert_eq!(history[0].status, RunStatus::Running);

    engine.shutdown().await;
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn restart_cancels_interrupted_runs_and_reruns_the_task() {
    let path = test_db_path("scheduler-recovery");
    let adapter = Arc::new(TestAdapter::new(TaskKind::SyncUsers, AdapterBehavior::Succeeds));
    let (store, engine) = seeded_engine(&path, enabled_config(), adapter.clone()).await;
    store
        .set_task_enabled(TaskKind::SyncUsers, true, OffsetDateTime::now_utc())
        .unwrap();
    let interrupted = simulate_interrupted_run(&store, TaskKind::SyncUsers);

    let report = engine.initialize_scheduler().await.unwrap().unwrap();
    assert_eq!(report.cancelled_runs, 1);
    assert_eq!(report.failed_tasks, vec![TaskKind::SyncUsers]);
    assert!(engine.get_scheduler_status().running);

    assert!(wait_until(|| adapter.calls.load(Ordering::SeqCst) == 1).await);
    engine.shutdown().await;
    assert!(!engine.get_scheduler_status().running);

    let history = store.get_task_history(TaskKind::SyncUsers, 10).unwrap();
    assert_eq!(history.len(), 2);
    let cancelled = history.iter().find(|run| run.id == interrupted).unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(
        history
            .iter()
            .any(|run| run.id != interrupted && run.status == RunStatus::Success)
    );
    assert!(
        history
            .iter()
            .all(|run| run.status != RunStatus::Running)
    );

    let definition = store.get_task(TaskKind::SyncUsers).unwrap().unwrap();
    assert_eq!(definition.last_status, TaskStatus::Success);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn second_initialize_is_a_no_op() {
    let path = test_db_path("scheduler-double-init");
    let adapter = Arc::new(TestAdapter::new(TaskKind::SyncUsers, AdapterBehavior::Succeeds));
    let (_store, engine) = seeded_engine(&path, enabled_config(), adapter).await;

    assert!(engine.initialize_scheduler().await.unwrap().is_some());
    assert!(engine.initialize_scheduler().await.unwrap().is_none());
    engine.shutdown().await;
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn poll_skips_kinds_that_are_still_running() {
    let path = test_db_path("scheduler-skip-running");
    let release = Arc::new(Notify::new());
    let adapter = Arc::new(TestAdapter::new(
        TaskKind::SyncGroups,
        AdapterBehavior::WaitsFor(release.clone()),
    ));
    let (store, engine) = seeded_engine(&path, SchedulerConfig::default(), adapter.clone()).await;
    store
        .set_task_enabled(TaskKind::SyncGroups, true, OffsetDateTime::now_utc())
        .unwrap();

    assert_eq!(engine.scheduler().poll_once().await, 1);
    let registry = engine.executor().registry().clone();
    assert!(wait_until(|| adapter.calls.load(Ordering::SeqCst) == 1).await);
    assert!(registry.is_running(TaskKind::SyncGroups));

    assert_eq!(engine.scheduler().poll_once().await, 0);

    release.notify_one();
    engine.shutdown().await;
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_task_history(TaskKind::SyncGroups, 10).unwrap().len(), 1);
    assert!(registry.is_empty());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn failing_dispatched_task_is_contained() {
    let path = test_db_path("scheduler-contained-failure");
    let adapter = Arc::new(TestAdapter::new(TaskKind::SyncCourses, AdapterBehavior::Fails));
    let (store, engine) = seeded_engine(&path, SchedulerConfig::default(), adapter.clone()).await;
    store
        .set_task_enabled(TaskKind::SyncCourses, true, OffsetDateTime::now_utc())
        .unwrap();

    assert_eq!(engine.scheduler().poll_once().await, 1);
    engine.shutdown().await;

    let definition = store.get_task(TaskKind::SyncCourses).unwrap().unwrap();
    assert_eq!(definition.last_status, TaskStatus::Failed);
    assert!(definition.next_run_at.unwrap() > OffsetDateTime::now_utc());
    assert_eq!(engine.scheduler().poll_once().await, 0);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn shutdown_aborts_work_past_the_grace_period() {
    let path = test_db_path("scheduler-grace");
    let adapter = Arc::new(TestAdapter::new(
        TaskKind::SyncEnrollments,
        AdapterBehavior::WaitsFor(Arc::new(Notify::new())),
    ));
    let (store, engine) = seeded_engine(&path, SchedulerConfig::default(), adapter.clone()).await;
    store
        .set_task_enabled(TaskKind::SyncEnrollments, true, OffsetDateTime::now_utc())
        .unwrap();

    assert_eq!(engine.scheduler().poll_once().await, 1);
    assert!(wait_until(|| adapter.calls.load(Ordering::SeqCst) == 1).await);

    let aborted = engine.scheduler().shutdown(Duration::from_millis(50)).await;
    assert_eq!(aborted, 1);
    let registry = engine.executor().registry().clone();
    assert!(wait_until(|| registry.is_empty()).await);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn scheduler_restarts_after_shutdown() {
    let path = test_db_path("scheduler-restart");
    let adapter = Arc::new(TestAdapter::new(TaskKind::SyncUsers, AdapterBehavior::Succeeds));
    let (_store, engine) = seeded_engine(&path, enabled_config(), adapter.clone()).await;
    engine.set_task_enabled(TaskKind::SyncUsers, true).await.unwrap();

    engine.initialize_scheduler().await.unwrap();
    assert!(wait_until(|| adapter.calls.load(Ordering::SeqCst) == 1).await);
    engine.shutdown().await;
    assert!(!engine.get_scheduler_status().running);

    for round in 2..=3 {
        engine.set_task_enabled(TaskKind::SyncUsers, false).await.unwrap();
        engine.set_task_enabled(TaskKind::SyncUsers, true).await.unwrap();

        assert!(engine.initialize_scheduler().await.unwrap().is_some());
        assert!(engine.get_scheduler_status().running);
        assert!(wait_until(|| adapter.calls.load(Ordering::SeqCst) == round).await);
        engine.shutdown().await;
        assert!(!engine.get_scheduler_status().running);
    }

    let history = engine.get_task_history(TaskKind::SyncUsers, 10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|run| run.status == RunStatus::Success));
    let _ = std::fs::remove_file(path);
}
