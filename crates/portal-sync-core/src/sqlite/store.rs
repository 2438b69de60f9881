use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use time::OffsetDateTime;

use crate::models::{
    CoreError, CoreErrorKind, NewTaskRun, RecoveryReport, RunCompletion, RunStatus, TaskConfig,
    TaskDefinition, TaskKind, TaskRunRecord, TaskSchedule, TaskStatus, TaskSummary,
};
use crate::persistence::{MigrationStore, PersistenceResult, TaskStore};
use crate::schedule::{format_schedule_time, parse_schedule_time};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "portal_sync_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const INTERRUPTED_MESSAGE: &str = "interrupted by process restart before completion";

const DEFINITION_COLUMNS: &str = "
    id, task_type, task_name, enabled, interval_minutes, schedule_day, schedule_time,
    config, last_status, last_error, last_run_at_unix, last_duration_seconds,
    run_count, fail_count, next_run_at_unix";

const HISTORY_COLUMNS: &str = "
    id, task_id, task_type, started_at_unix, completed_at_unix, status,
    duration_seconds, records_processed, result_summary, error_message";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }

    fn update_definition(
        &self,
        operation_name: &str,
        kind: TaskKind,
        operation: impl FnOnce(&Connection) -> rusqlite::Result<usize>,
    ) -> PersistenceResult<()> {
        let changed = self.with_connection(operation_name, |connection| {
            ensure_schema_ready(connection)?;
            operation(connection)
        })?;
        if changed == 0 {
            return Err(CoreError::not_found(kind));
        }
        Ok(())
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // DDL is IF NOT EXISTS throughout, so replaying it repairs a
                // database whose version row survived but tables did not.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteStore {
    fn ensure_task(&self, definition: &TaskDefinition) -> PersistenceResult<bool> {
        self.with_connection("ensure_task", |connection| {
            ensure_schema_ready(connection)?;
            let inserted = connection.execute(
                "
INSERT INTO task_definitions (
    task_type, task_name, enabled, interval_minutes, schedule_day, schedule_time,
    config, last_status, next_run_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'idle', ?8)
ON CONFLICT(task_type) DO NOTHING
",
                params![
                    definition.kind.as_str(),
                    definition.name,
                    bool_to_sqlite(definition.enabled),
                    i64::from(definition.schedule.interval_minutes),
                    definition.schedule.schedule_day.map(i64::from),
                    definition.schedule.schedule_time.map(format_schedule_time),
                    definition.config.to_json_string(),
                    definition.next_run_at.map(to_unix_seconds),
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    fn get_all_tasks(&self) -> PersistenceResult<Vec<TaskSummary>> {
        self.with_connection("get_all_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {DEFINITION_COLUMNS},
    (SELECT COUNT(*) FROM task_run_history h WHERE h.task_type = d.task_type) AS total_runs,
    (SELECT MAX(h.completed_at_unix) FROM task_run_history h
        WHERE h.task_type = d.task_type AND h.status = 'success') AS last_success_at_unix
FROM task_definitions d
ORDER BY task_type
"
            ))?;

            let rows = statement.query_map([], |row| {
                let definition = read_definition(row)?;
                let total_runs: i64 = row.get(15)?;
                let last_success_unix: Option<i64> = row.get(16)?;
                Ok(TaskSummary {
                    definition,
                    total_runs: i64_to_u64(total_runs)?,
                    last_success_at: last_success_unix.map(from_unix_seconds).transpose()?,
                })
            })?;

            skip_undecodable("get_all_tasks", rows)
        })
    }

    fn get_task(&self, kind: TaskKind) -> PersistenceResult<Option<TaskDefinition>> {
        self.with_connection("get_task", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!(
                        "SELECT {DEFINITION_COLUMNS} FROM task_definitions WHERE task_type = ?1"
                    ),
                    [kind.as_str()],
                    read_definition,
                )
                .optional()
        })
    }

    fn set_task_enabled(
        &self,
        kind: TaskKind,
        enabled: bool,
        now: OffsetDateTime,
    ) -> PersistenceResult<()> {
        let next_run_at = enabled.then(|| to_unix_seconds(now));
        self.update_definition("set_task_enabled", kind, |connection| {
            connection.execute(
                "
UPDATE task_definitions
SET enabled = ?2, next_run_at_unix = ?3
WHERE task_type = ?1
",
                params![kind.as_str(), bool_to_sqlite(enabled), next_run_at],
            )
        })
    }

    fn update_task_config(&self, kind: TaskKind, config: &TaskConfig) -> PersistenceResult<()> {
        if !config.matches_kind(kind) {
            return Err(CoreError::for_task(
                kind,
                CoreErrorKind::InvalidInput,
                format!("config shape does not belong to task '{kind}'"),
            ));
        }
        let raw = config.to_json_string();
        self.update_definition("update_task_config", kind, |connection| {
            connection.execute(
                "UPDATE task_definitions SET config = ?2 WHERE task_type = ?1",
                params![kind.as_str(), raw],
            )
        })
    }

    fn update_task_schedule(
        &self,
        kind: TaskKind,
        schedule: &TaskSchedule,
        next_run_at: Option<OffsetDateTime>,
    ) -> PersistenceResult<()> {
        self.update_definition("update_task_schedule", kind, |connection| {
            connection.execute(
                "
UPDATE task_definitions
SET interval_minutes = ?2, schedule_day = ?3, schedule_time = ?4, next_run_at_unix = ?5
WHERE task_type = ?1
",
                params![
                    kind.as_str(),
                    i64::from(schedule.interval_minutes),
                    schedule.schedule_day.map(i64::from),
                    schedule.schedule_time.map(format_schedule_time),
                    next_run_at.map(to_unix_seconds),
                ],
            )
        })
    }

    fn due_tasks(&self, now: OffsetDateTime) -> PersistenceResult<Vec<TaskDefinition>> {
        self.with_connection("due_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {DEFINITION_COLUMNS}
FROM task_definitions
WHERE enabled = 1
  AND (next_run_at_unix IS NULL OR next_run_at_unix <= ?1)
ORDER BY next_run_at_unix ASC, task_type ASC
"
            ))?;
            let rows = statement.query_map([to_unix_seconds(now)], read_definition)?;
            skip_undecodable("due_tasks", rows)
        })
    }

    fn mark_task_running(&self, kind: TaskKind, now: OffsetDateTime) -> PersistenceResult<()> {
        self.update_definition("mark_task_running", kind, |connection| {
            connection.execute(
                "
UPDATE task_definitions
SET last_status = 'running', last_run_at_unix = ?2
WHERE task_type = ?1
",
                params![kind.as_str(), to_unix_seconds(now)],
            )
        })
    }

    fn record_task_success(
        &self,
        kind: TaskKind,
        duration_seconds: f64,
        next_run_at: OffsetDateTime,
    ) -> PersistenceResult<()> {
        self.update_definition("record_task_success", kind, |connection| {
            connection.execute(
                "
UPDATE task_definitions
SET last_status = 'success',
    last_error = NULL,
    last_duration_seconds = ?2,
    run_count = run_count + 1,
    next_run_at_unix = ?3
WHERE task_type = ?1
",
                params![kind.as_str(), duration_seconds, to_unix_seconds(next_run_at)],
            )
        })
    }

    fn record_task_failure(
        &self,
        kind: TaskKind,
        error_message: &str,
        duration_seconds: f64,
        next_run_at: OffsetDateTime,
    ) -> PersistenceResult<()> {
        self.update_definition("record_task_failure", kind, |connection| {
            connection.execute(
                "
UPDATE task_definitions
SET last_status = 'failed',
    last_error = ?2,
    last_duration_seconds = ?3,
    fail_count = fail_count + 1,
    next_run_at_unix = ?4
WHERE task_type = ?1
",
                params![
                    kind.as_str(),
                    error_message,
                    duration_seconds,
                    to_unix_seconds(next_run_at),
                ],
            )
        })
    }

    fn insert_run(&self, run: &NewTaskRun) -> PersistenceResult<i64> {
        self.with_connection("insert_run", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO task_run_history (task_id, task_type, started_at_unix, status)
VALUES (?1, ?2, ?3, 'running')
",
                params![run.task_id, run.kind.as_str(), to_unix_seconds(run.started_at)],
            )?;
            Ok(connection.last_insert_rowid())
        })
    }

    fn complete_run(&self, run_id: i64, completion: &RunCompletion) -> PersistenceResult<bool> {
        if !completion.status.is_terminal() {
            return Err(storage_error_text(
                "complete_run",
                "history rows can only be completed with a terminal status",
            ));
        }
        let summary = completion
            .result_summary
            .as_ref()
            .map(serde_json::Value::to_string);
        self.with_connection("complete_run", |connection| {
            ensure_schema_ready(connection)?;
            let changed = connection.execute(
                "
UPDATE task_run_history
SET status = ?2,
    completed_at_unix = ?3,
    duration_seconds = ?4,
    records_processed = ?5,
    result_summary = ?6,
    error_message = ?7
WHERE id = ?1 AND status = 'running'
",
                params![
                    run_id,
                    completion.status.as_str(),
                    to_unix_seconds(completion.completed_at),
                    completion.duration_seconds,
                    u64_to_i64(completion.records_processed)?,
                    summary,
                    completion.error_message.as_deref(),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    fn get_task_history(
        &self,
        kind: TaskKind,
        limit: usize,
    ) -> PersistenceResult<Vec<TaskRunRecord>> {
        self.with_connection("get_task_history", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {HISTORY_COLUMNS}
FROM task_run_history
WHERE task_type = ?1
ORDER BY started_at_unix DESC, id DESC
LIMIT ?2
"
            ))?;
            let rows = statement.query_map(params![kind.as_str(), to_i64(limit)?], read_run)?;
            rows.collect()
        })
    }

    fn last_success_at(&self, kind: TaskKind) -> PersistenceResult<Option<OffsetDateTime>> {
        self.with_connection("last_success_at", |connection| {
            ensure_schema_ready(connection)?;
            let latest: Option<i64> = connection.query_row(
                "
SELECT MAX(started_at_unix)
FROM task_run_history
WHERE task_type = ?1 AND status = 'success'
",
                [kind.as_str()],
                |row| row.get(0),
            )?;
            latest.map(from_unix_seconds).transpose()
        })
    }

    fn recover_interrupted(&self, now: OffsetDateTime) -> PersistenceResult<RecoveryReport> {
        let now_unix = to_unix_seconds(now);
        self.with_connection("recover_interrupted", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;

            let failed_tasks = {
                let mut statement = transaction.prepare(
                    "
SELECT task_type FROM task_definitions
WHERE last_status = 'running'
ORDER BY task_type
",
                )?;
                let rows = statement.query_map([], |row| {
                    let raw: String = row.get(0)?;
                    parse_task_kind(&raw)
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            transaction.execute(
                "
UPDATE task_definitions
SET last_status = 'failed', last_error = ?1, next_run_at_unix = ?2
WHERE last_status = 'running'
",
                params![INTERRUPTED_MESSAGE, now_unix],
            )?;

            let cancelled_runs = transaction.execute(
                "
UPDATE task_run_history
SET status = 'cancelled',
    completed_at_unix = ?1,
    duration_seconds = MAX(?1 - started_at_unix, 0),
    error_message = ?2
WHERE status = 'running'
",
                params![now_unix, INTERRUPTED_MESSAGE],
            )?;

            transaction.commit()?;
            Ok(RecoveryReport {
                cancelled_runs,
                failed_tasks,
            })
        })
    }

    fn prune_history(&self, older_than: OffsetDateTime) -> PersistenceResult<usize> {
        self.with_connection("prune_history", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "DELETE FROM task_run_history WHERE started_at_unix < ?1 AND status != 'running'",
                [to_unix_seconds(older_than)],
            )
        })
    }
}

fn read_definition(row: &Row<'_>) -> rusqlite::Result<TaskDefinition> {
    let kind_raw: String = row.get(1)?;
    let kind = parse_task_kind(&kind_raw)?;
    let interval_minutes: i64 = row.get(4)?;
    let schedule_day: Option<i64> = row.get(5)?;
    let schedule_time: Option<String> = row.get(6)?;
    let config_raw: String = row.get(7)?;
    let status_raw: String = row.get(8)?;
    let last_run_at: Option<i64> = row.get(10)?;
    let run_count: i64 = row.get(12)?;
    let fail_count: i64 = row.get(13)?;
    let next_run_at: Option<i64> = row.get(14)?;

    let schedule = TaskSchedule {
        interval_minutes: u32::try_from(interval_minutes)
            .map_err(|_| storage_error_sqlite("interval_minutes out of range in sqlite record"))?,
        schedule_day: schedule_day
            .map(|day| {
                u8::try_from(day)
                    .map_err(|_| storage_error_sqlite("schedule_day out of range in sqlite record"))
            })
            .transpose()?,
        schedule_time: schedule_time
            .as_deref()
            .map(|raw| {
                parse_schedule_time(raw).map_err(|error| storage_error_sqlite(&error.message))
            })
            .transpose()?,
    };

    let config = TaskConfig::from_json_str(kind, &config_raw)
        .map_err(|error| storage_error_sqlite(&error.message))?;
    let last_status = status_raw
        .parse::<TaskStatus>()
        .map_err(|error| storage_error_sqlite(&error.message))?;

    Ok(TaskDefinition {
        id: row.get(0)?,
        kind,
        name: row.get(2)?,
        enabled: sqlite_to_bool(row.get(3)?),
        schedule,
        config,
        last_status,
        last_error: row.get(9)?,
        last_run_at: last_run_at.map(from_unix_seconds).transpose()?,
        last_duration_seconds: row.get(11)?,
        run_count: i64_to_u64(run_count)?,
        fail_count: i64_to_u64(fail_count)?,
        next_run_at: next_run_at.map(from_unix_seconds).transpose()?,
    })
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<TaskRunRecord> {
    let kind_raw: String = row.get(2)?;
    let started_at: i64 = row.get(3)?;
    let completed_at: Option<i64> = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let records_processed: i64 = row.get(7)?;
    let summary_raw: Option<String> = row.get(8)?;

    let result_summary = summary_raw
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|_| storage_error_sqlite("invalid result_summary JSON in sqlite record"))
        })
        .transpose()?;

    Ok(TaskRunRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        kind: parse_task_kind(&kind_raw)?,
        started_at: from_unix_seconds(started_at)?,
        completed_at: completed_at.map(from_unix_seconds).transpose()?,
        status: status_raw
            .parse::<RunStatus>()
            .map_err(|error| storage_error_sqlite(&error.message))?,
        duration_seconds: row.get(6)?,
        records_processed: i64_to_u64(records_processed)?,
        result_summary,
        error_message: row.get(9)?,
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before task operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

/// Collects catalog rows, dropping rows whose persisted values no longer decode.
/// Connection and query errors still fail the whole read.
fn skip_undecodable<T>(
    operation_name: &'static str,
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut decoded = Vec::new();
    for row in rows {
        match row {
            Ok(value) => decoded.push(value),
            Err(
                error @ (rusqlite::Error::ToSqlConversionFailure(_)
                | rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::InvalidColumnType(..)
                | rusqlite::Error::IntegralValueOutOfRange(..)),
            ) => {
                tracing::warn!(
                    operation = operation_name,
                    error = %error,
                    "skipping undecodable task definition row"
                );
            }
            Err(error) => return Err(error),
        }
    }
    Ok(decoded)
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_task_kind(raw: &str) -> rusqlite::Result<TaskKind> {
    raw.parse::<TaskKind>().map_err(|_| {
        storage_error_sqlite(&format!(
            "unknown task type '{raw}' found in persisted sqlite record"
        ))
    })
}

fn bool_to_sqlite(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn to_unix_seconds(value: OffsetDateTime) -> i64 {
    value.unix_timestamp()
}

fn from_unix_seconds(value: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value).map_err(|error| {
        storage_error_sqlite(&format!("invalid unix timestamp '{value}': {error}"))
    })
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative counter in sqlite record"))
}

fn u64_to_i64(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
