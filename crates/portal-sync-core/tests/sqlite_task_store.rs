use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use portal_sync_core::models::{
    CoreErrorKind, CrmPushConfig, EntitySyncConfig, NewTaskRun, RunCompletion, RunStatus,
    TaskConfig, TaskDefinition, TaskKind, TaskSchedule, TaskStatus,
};
use portal_sync_core::persistence::{MigrationStore, TaskStore};
use portal_sync_core::sqlite::{SqliteStore, current_schema_version};
use serde_json::json;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("portal-sync-{test_name}-{nanos}.sqlite3"))
}

fn migrated_store(test_name: &str) -> (PathBuf, SqliteStore) {
    let path = test_db_path(test_name);
    let store = SqliteStore::new(&path);
    store.migrate_to_latest().unwrap();
    (path, store)
}

fn entity_task(kind: TaskKind) -> TaskDefinition {
    TaskDefinition::new(kind, format!("{kind} task"), TaskSchedule::every_minutes(60))
}

fn success(at: OffsetDateTime, records: u64) -> RunCompletion {
    RunCompletion {
        status: RunStatus::Success,
        completed_at: at,
        duration_seconds: 2.5,
        records_processed: records,
        result_summary: Some(json!({ "records": records })),
        error_message: None,
    }
}

#[test]
fn migrate_to_latest_reaches_current_version_and_is_idempotent() {
    let (path, store) = migrated_store("store-migrate");
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);
    store.migrate_to_latest().unwrap();
    assert!(store.get_all_tasks().unwrap().is_empty());

    let _ = std::fs::remove_file(path);
}

#[test]
fn ensure_task_inserts_once_and_keeps_existing_rows() {
    let (path, store) = migrated_store("store-ensure");
    let definition = entity_task(TaskKind::SyncUsers);

    assert!(store.ensure_task(&definition).unwrap());
    store
        .set_task_enabled(TaskKind::SyncUsers, false, datetime!(2024-01-10 09:00 UTC))
        .unwrap();
    assert!(!store.ensure_task(&definition).unwrap());

    let stored = store.get_task(TaskKind::SyncUsers).unwrap().unwrap();
    assert!(!stored.enabled);
    assert_eq!(stored.name, "sync_users task");
    assert_eq!(stored.last_status, TaskStatus::Idle);
    assert_eq!(stored.schedule, TaskSchedule::every_minutes(60));
    assert_eq!(stored.config, TaskConfig::default_for(TaskKind::SyncUsers));

    let _ = std::fs::remove_file(path);
}

#[test]
fn enabling_makes_task_due_and_disabling_clears_next_run() {
    let (path, store) = migrated_store("store-enable");
    store
        .ensure_task(&entity_task(TaskKind::SyncGroups).disabled())
        .unwrap();
    let now = datetime!(2024-01-10 09:00 UTC);

    store.set_task_enabled(TaskKind::SyncGroups, true, now).unwrap();
    let enabled = store.get_task(TaskKind::SyncGroups).unwrap().unwrap();
    assert!(enabled.enabled);
    assert_eq!(enabled.next_run_at, Some(now));
    assert_eq!(store.due_tasks(now).unwrap().len(), 1);

    store.set_task_enabled(TaskKind::SyncGroups, false, now).unwrap();
    let disabled = store.get_task(TaskKind::SyncGroups).unwrap().unwrap();
    assert!(!disabled.enabled);
    assert_eq!(disabled.next_run_at, None);
    assert!(store.due_tasks(now).unwrap().is_empty());

    let _ = std::fs::remove_file(path);
}

#[test]
fn unknown_task_updates_report_not_found() {
    let (path, store) = migrated_store("store-not-found");

    let error = store
        .set_task_enabled(TaskKind::PushCrm, true, OffsetDateTime::now_utc())
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);
    assert_eq!(error.task, Some(TaskKind::PushCrm));
    assert!(store.get_task(TaskKind::PushCrm).unwrap().is_none());

    let _ = std::fs::remove_file(path);
}

#[test]
fn due_tasks_filters_enabled_and_orders_by_next_run() {
    let (path, store) = migrated_store("store-due");
    let now = datetime!(2024-01-10 09:00 UTC);

    store
        .ensure_task(
            &entity_task(TaskKind::SyncUsers).with_next_run_at(Some(now - Duration::minutes(5))),
        )
        .unwrap();
    store
        .ensure_task(&entity_task(TaskKind::SyncGroups).with_next_run_at(None))
        .unwrap();
    store
        .ensure_task(&entity_task(TaskKind::SyncCourses).with_next_run_at(Some(now)))
        .unwrap();
    store
        .ensure_task(
            &entity_task(TaskKind::SyncEnrollments)
                .with_next_run_at(Some(now + Duration::seconds(1))),
        )
        .unwrap();
    store
        .ensure_task(
            &entity_task(TaskKind::PushCrm)
                .disabled()
                .with_next_run_at(Some(now - Duration::hours(1))),
        )
        .unwrap();

    let due: Vec<TaskKind> = store
        .due_tasks(now)
        .unwrap()
        .into_iter()
        .map(|definition| definition.kind)
        .collect();
    assert_eq!(
        due,
        vec![TaskKind::SyncGroups, TaskKind::SyncUsers, TaskKind::SyncCourses]
    );

    let _ = std::fs::remove_file(path);
}

#[test]
fn lifecycle_writes_update_counters_and_history() {
    let (path, store) = migrated_store("store-lifecycle");
    store.ensure_task(&entity_task(TaskKind::SyncCourses)).unwrap();
    let task_id = store.get_task(TaskKind::SyncCourses).unwrap().unwrap().id;
    let started = datetime!(2024-01-10 09:00 UTC);

    store.mark_task_running(TaskKind::SyncCourses, started).unwrap();
    let run_id = store
        .insert_run(&NewTaskRun {
            task_id,
            kind: TaskKind::SyncCourses,
            started_at: started,
        })
        .unwrap();
    let running = store.get_task(TaskKind::SyncCourses).unwrap().unwrap();
    assert_eq!(running.last_status, TaskStatus::Running);
    assert_eq!(running.last_run_at, Some(started));

    let completed_at = started + Duration::seconds(3);
    assert!(store.complete_run(run_id, &success(completed_at, 42)).unwrap());
    assert!(!store.complete_run(run_id, &success(completed_at, 7)).unwrap());
    store
        .record_task_success(TaskKind::SyncCourses, 3.0, started + Duration::hours(1))
        .unwrap();

    let definition = store.get_task(TaskKind::SyncCourses).unwrap().unwrap();
    assert_eq!(definition.last_status, TaskStatus::Success);
    assert_eq!(definition.run_count, 1);
    assert_eq!(definition.fail_count, 0);
    assert_eq!(definition.last_duration_seconds, Some(3.0));
    assert_eq!(definition.next_run_at, Some(started + Duration::hours(1)));

    let history = store.get_task_history(TaskKind::SyncCourses, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Success);
    assert_eq!(history[0].records_processed, 42);
    assert_eq!(history[0].result_summary, Some(json!({ "records": 42 })));
    assert_eq!(history[0].completed_at, Some(completed_at));

    let later = started + Duration::hours(1);
    store.mark_task_running(TaskKind::SyncCourses, later).unwrap();
    let failed_run = store
        .insert_run(&NewTaskRun {
            task_id,
            kind: TaskKind::SyncCourses,
            started_at: later,
        })
        .unwrap();
    store
        .complete_run(
            failed_run,
            &RunCompletion {
                status: RunStatus::Failed,
                completed_at: later + Duration::seconds(1),
                duration_seconds: 1.0,
                records_processed: 0,
                result_summary: None,
                error_message: Some("portal returned 503".to_string()),
            },
        )
        .unwrap();
    store
        .record_task_failure(
            TaskKind::SyncCourses,
            "portal returned 503",
            1.0,
            later + Duration::minutes(30),
        )
        .unwrap();

    let definition = store.get_task(TaskKind::SyncCourses).unwrap().unwrap();
    assert_eq!(definition.last_status, TaskStatus::Failed);
    assert_eq!(definition.last_error.as_deref(), Some("portal returned 503"));
    assert_eq!(definition.fail_count, 1);
    assert_eq!(definition.run_count, 1);

    let history = store.get_task_history(TaskKind::SyncCourses, 10).unwrap();
    let statuses: Vec<RunStatus> = history.iter().map(|run| run.status).collect();
    assert_eq!(statuses, vec![RunStatus::Failed, RunStatus::Success]);
    assert_eq!(store.get_task_history(TaskKind::SyncCourses, 1).unwrap().len(), 1);

    assert_eq!(
        store.last_success_at(TaskKind::SyncCourses).unwrap(),
        Some(started)
    );

    let summary = store
        .get_all_tasks()
        .unwrap()
        .into_iter()
        .find(|summary| summary.definition.kind == TaskKind::SyncCourses)
        .unwrap();
    assert_eq!(summary.total_runs, 2);
    assert_eq!(summary.last_success_at, Some(completed_at));

    let _ = std::fs::remove_file(path);
}

#[test]
fn complete_run_rejects_non_terminal_status() {
    let (path, store) = migrated_store("store-non-terminal");
    store.ensure_task(&entity_task(TaskKind::SyncUsers)).unwrap();
    let run_id = store
        .insert_run(&NewTaskRun {
            task_id: 1,
            kind: TaskKind::SyncUsers,
            started_at: OffsetDateTime::now_utc(),
        })
        .unwrap();

    let error = store
        .complete_run(
            run_id,
            &RunCompletion {
                status: RunStatus::Running,
                ..success(OffsetDateTime::now_utc(), 0)
            },
        )
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let _ = std::fs::remove_file(path);
}

#[test]
fn recover_interrupted_cancels_running_rows_and_reschedules_tasks() {
    let (path, store) = migrated_store("store-recover");
    store.ensure_task(&entity_task(TaskKind::SyncUsers)).unwrap();
    store.ensure_task(&entity_task(TaskKind::SyncGroups)).unwrap();
    let started = datetime!(2024-01-10 09:00 UTC);

    store.mark_task_running(TaskKind::SyncUsers, started).unwrap();
    let run_id = store
        .insert_run(&NewTaskRun {
            task_id: 1,
            kind: TaskKind::SyncUsers,
            started_at: started,
        })
        .unwrap();

    let now = started + Duration::minutes(10);
    let report = store.recover_interrupted(now).unwrap();
    assert_eq!(report.cancelled_runs, 1);
    assert_eq!(report.failed_tasks, vec![TaskKind::SyncUsers]);

    let definition = store.get_task(TaskKind::SyncUsers).unwrap().unwrap();
    assert_eq!(definition.last_status, TaskStatus::Failed);
    assert!(definition.last_error.unwrap().contains("interrupted by process restart"));
    assert_eq!(definition.next_run_at, Some(now));

    let history = store.get_task_history(TaskKind::SyncUsers, 10).unwrap();
    assert_eq!(history[0].id, run_id);
    assert_eq!(history[0].status, RunStatus::Cancelled);
    assert_eq!(history[0].completed_at, Some(now));
    assert_eq!(history[0].duration_seconds, Some(600.0));
    assert!(
        history[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("interrupted by process restart")
    );

    let untouched = store.get_task(TaskKind::SyncGroups).unwrap().unwrap();
    assert_eq!(untouched.last_status, TaskStatus::Idle);

    assert!(store.recover_interrupted(now).unwrap().is_empty());

    let _ = std::fs::remove_file(path);
}

#[test]
fn prune_history_keeps_running_and_recent_rows() {
    let (path, store) = migrated_store("store-prune");
    store.ensure_task(&entity_task(TaskKind::SyncUsers)).unwrap();
    let old = datetime!(2023-06-01 00:00 UTC);
    let recent = datetime!(2024-01-09 00:00 UTC);

    let old_done = store
        .insert_run(&NewTaskRun { task_id: 1, kind: TaskKind::SyncUsers, started_at: old })
        .unwrap();
    store.complete_run(old_done, &success(old, 1)).unwrap();
    store
        .insert_run(&NewTaskRun { task_id: 1, kind: TaskKind::SyncUsers, started_at: old })
        .unwrap();
    let recent_done = store
        .insert_run(&NewTaskRun { task_id: 1, kind: TaskKind::SyncUsers, started_at: recent })
        .unwrap();
    store.complete_run(recent_done, &success(recent, 1)).unwrap();

    let deleted = store.prune_history(datetime!(2024-01-01 00:00 UTC)).unwrap();
    assert_eq!(deleted, 1);

    let remaining = store.get_task_history(TaskKind::SyncUsers, 10).unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().any(|run| run.status == RunStatus::Running));

    let _ = std::fs::remove_file(path);
}

#[test]
fn config_and_schedule_updates_round_through_the_store() {
    let (path, store) = migrated_store("store-config");
    store.ensure_task(&entity_task(TaskKind::PushCrm)).unwrap();

    let mismatched = TaskConfig::EntitySync(EntitySyncConfig::default());
    let error = store
        .update_task_config(TaskKind::PushCrm, &mismatched)
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);

    let config = TaskConfig::parse(TaskKind::PushCrm, &json!({ "sync_types": ["users"] })).unwrap();
    assert!(matches!(config, TaskConfig::CrmPush(CrmPushConfig { .. })));
    store.update_task_config(TaskKind::PushCrm, &config).unwrap();
    assert_eq!(
        store.get_task(TaskKind::PushCrm).unwrap().unwrap().config,
        config
    );

    let weekly = TaskSchedule::weekly(0, time::macros::time!(03:30), 10_080);
    let next = datetime!(2024-01-14 03:30 UTC);
    store
        .update_task_schedule(TaskKind::PushCrm, &weekly, Some(next))
        .unwrap();
    let stored = store.get_task(TaskKind::PushCrm).unwrap().unwrap();
    assert_eq!(stored.schedule, weekly);
    assert_eq!(stored.next_run_at, Some(next));

    let _ = std::fs::remove_file(path);
}

#[test]
fn undecodable_rows_are_skipped_by_catalog_queries() {
    let (path, store) = migrated_store("store-undecodable");
    let now = datetime!(2024-01-10 09:00 UTC);
    store.ensure_task(&entity_task(TaskKind::SyncUsers)).unwrap();
    store.ensure_task(&entity_task(TaskKind::SyncGroups)).unwrap();
    store.set_task_enabled(TaskKind::SyncUsers, true, now).unwrap();
    store.set_task_enabled(TaskKind::SyncGroups, true, now).unwrap();

    let connection = rusqlite::Connection::open(&path).unwrap();
    connection
        .execute(
            "INSERT INTO task_definitions (task_type, task_name, enabled, interval_minutes)
             VALUES ('sync_npcu_rollup', 'Retired rollup', 1, 60)",
            [],
        )
        .unwrap();
    connection
        .execute(
            "UPDATE task_definitions SET config = '[' WHERE task_type = 'sync_groups'",
            [],
        )
        .unwrap();
    drop(connection);

    let due = store.due_tasks(now + Duration::minutes(1)).unwrap();
    let due_kinds: Vec<TaskKind> = due.iter().map(|definition| definition.kind).collect();
    assert_eq!(due_kinds, vec![TaskKind::SyncUsers]);

    let all = store.get_all_tasks().unwrap();
    let all_kinds: Vec<TaskKind> = all.iter().map(|summary| summary.definition.kind).collect();
    assert_eq!(all_kinds, vec![TaskKind::SyncUsers]);

    assert!(store.get_task(TaskKind::SyncGroups).is_err());
    let _ = std::fs::remove_file(path);
}
