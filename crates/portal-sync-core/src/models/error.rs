use serde::Serialize;
use thiserror::Error;

use crate::models::TaskKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    /// The task type already holds the process-local mutex.
    MutexViolation,
    ExecutorFailure,
    StepFailure,
    StorageFailure,
    InvalidInput,
    NotFound,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskKind>,
    pub step: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            step: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_task(task: TaskKind, kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: Some(task),
            step: None,
            kind,
            message: message.into(),
        }
    }

    pub fn mutex_violation(task: TaskKind) -> Self {
        Self::for_task(
            task,
            CoreErrorKind::MutexViolation,
            format!("task '{task}' is already running"),
        )
    }

    pub fn not_found(task: TaskKind) -> Self {
        Self::for_task(
            task,
            CoreErrorKind::NotFound,
            format!("no task definition exists for '{task}'"),
        )
    }

    pub fn with_task(mut self, task: TaskKind) -> Self {
        self.task = self.task.or(Some(task));
        self
    }

    pub fn is_mutex_violation(&self) -> bool {
        self.kind == CoreErrorKind::MutexViolation
    }
}
