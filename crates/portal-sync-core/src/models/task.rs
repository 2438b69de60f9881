use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time};

use crate::models::{CoreError, CoreErrorKind, TaskConfig};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SyncUsers,
    SyncGroups,
    SyncCourses,
    SyncEnrollments,
    PushCrm,
    DailySyncChain,
    HistoryCleanup,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::SyncUsers,
        TaskKind::SyncGroups,
        TaskKind::SyncCourses,
        TaskKind::SyncEnrollments,
        TaskKind::PushCrm,
        TaskKind::DailySyncChain,
        TaskKind::HistoryCleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::SyncUsers => "sync_users",
            TaskKind::SyncGroups => "sync_groups",
            TaskKind::SyncCourses => "sync_courses",
            TaskKind::SyncEnrollments => "sync_enrollments",
            TaskKind::PushCrm => "push_crm",
            TaskKind::DailySyncChain => "daily_sync_chain",
            TaskKind::HistoryCleanup => "history_cleanup",
        }
    }

    /// Kinds whose body lives in the executor rather than in a registered adapter.
    pub fn is_builtin(self) -> bool {
        matches!(self, TaskKind::DailySyncChain | TaskKind::HistoryCleanup)
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("unknown task type '{raw}'"),
                )
            })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "idle" => Ok(TaskStatus::Idle),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("unknown task status '{raw}'"),
            )),
        }
    }
}

/// Cadence of a task: a weekly calendar slot when both `schedule_day` and
/// `schedule_time` are set, otherwise a fixed interval.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskSchedule {
    pub interval_minutes: u32,
    /// 0 = Sunday .. 6 = Saturday.
    pub schedule_day: Option<u8>,
    #[serde(with = "crate::schedule::hms_option", default)]
    pub schedule_time: Option<Time>,
}

impl TaskSchedule {
    pub fn every_minutes(interval_minutes: u32) -> Self {
        Self {
            interval_minutes,
            schedule_day: None,
            schedule_time: None,
        }
    }

    pub fn weekly(schedule_day: u8, schedule_time: Time, interval_minutes: u32) -> Self {
        Self {
            interval_minutes,
            schedule_day: Some(schedule_day),
            schedule_time: Some(schedule_time),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskDefinition {
    pub id: i64,
    #[serde(rename = "task_type")]
    pub kind: TaskKind,
    #[serde(rename = "task_name")]
    pub name: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub schedule: TaskSchedule,
    pub config: TaskConfig,
    pub last_status: TaskStatus,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    pub last_duration_seconds: Option<f64>,
    pub run_count: u64,
    pub fail_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_run_at: Option<OffsetDateTime>,
}

impl TaskDefinition {
    pub fn new(kind: TaskKind, name: impl Into<String>, schedule: TaskSchedule) -> Self {
        Self {
            id: 0,
            kind,
            name: name.into(),
            enabled: true,
            schedule,
            config: TaskConfig::default_for(kind),
            last_status: TaskStatus::Idle,
            last_error: None,
            last_run_at: None,
            last_duration_seconds: None,
            run_count: 0,
            fail_count: 0,
            next_run_at: None,
        }
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_next_run_at(mut self, next_run_at: Option<OffsetDateTime>) -> Self {
        self.next_run_at = next_run_at;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskSummary {
    #[serde(flatten)]
    pub definition: TaskDefinition,
    pub total_runs: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
}
