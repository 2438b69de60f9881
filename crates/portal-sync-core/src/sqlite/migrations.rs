#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_task_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL UNIQUE,
    task_name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    interval_minutes INTEGER NOT NULL,
    schedule_day INTEGER CHECK (schedule_day IS NULL OR schedule_day BETWEEN 0 AND 6),
    schedule_time TEXT,
    config TEXT NOT NULL DEFAULT '{}',
    last_status TEXT NOT NULL DEFAULT 'idle',
    last_error TEXT,
    last_run_at_unix INTEGER,
    last_duration_seconds REAL,
    run_count INTEGER NOT NULL DEFAULT 0,
    fail_count INTEGER NOT NULL DEFAULT 0,
    next_run_at_unix INTEGER
);

CREATE TABLE IF NOT EXISTS task_run_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    task_type TEXT NOT NULL,
    started_at_unix INTEGER NOT NULL,
    completed_at_unix INTEGER,
    status TEXT NOT NULL,
    duration_seconds REAL,
    records_processed INTEGER NOT NULL DEFAULT 0,
    result_summary TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_run_history_type_started
    ON task_run_history (task_type, started_at_unix DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_run_history_type_started;
DROP TABLE IF EXISTS task_run_history;
DROP TABLE IF EXISTS task_definitions;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_run_history_status_index",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_task_run_history_status
    ON task_run_history (status);

CREATE INDEX IF NOT EXISTS idx_task_definitions_due
    ON task_definitions (enabled, next_run_at_unix);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_definitions_due;
DROP INDEX IF EXISTS idx_task_run_history_status;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
