use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::models::{CoreError, CoreErrorKind, TaskKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("unknown run status '{raw}'"),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskRunRecord {
    pub id: i64,
    pub task_id: i64,
    #[serde(rename = "task_type")]
    pub kind: TaskKind,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub status: RunStatus,
    pub duration_seconds: Option<f64>,
    pub records_processed: u64,
    pub result_summary: Option<Value>,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewTaskRun {
    pub task_id: i64,
    pub kind: TaskKind,
    pub started_at: OffsetDateTime,
}

/// The single terminal update applied to a history row.
#[derive(Clone, Debug, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub completed_at: OffsetDateTime,
    pub duration_seconds: f64,
    pub records_processed: u64,
    pub result_summary: Option<Value>,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub cancelled_runs: usize,
    pub failed_tasks: Vec<TaskKind>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.cancelled_runs == 0 && self.failed_tasks.is_empty()
    }
}
