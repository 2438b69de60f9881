use serde::Serialize;
use time::OffsetDateTime;

use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepResult {
    pub name: String,
    #[serde(rename = "task_type")]
    pub kind: TaskKind,
    pub required: bool,
    pub status: StepStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub duration_seconds: f64,
    pub records_processed: u64,
    pub error: Option<String>,
}

impl StepResult {
    pub fn skipped(name: &str, kind: TaskKind, required: bool, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required,
            status: StepStatus::Skipped,
            started_at: None,
            completed_at: None,
            duration_seconds: 0.0,
            records_processed: 0,
            error: Some(reason.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Created,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SyncContextStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl SyncContextStats {
    /// Every cache hit is an external call that did not happen.
    pub fn api_calls_avoided(&self) -> u64 {
        self.hits
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChainRun {
    pub chain_id: String,
    pub status: ChainStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub duration_seconds: f64,
    pub steps: Vec<StepResult>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub cache: SyncContextStats,
}

impl ChainRun {
    pub fn new(chain_id: impl Into<String>, started_at: OffsetDateTime) -> Self {
        Self {
            chain_id: chain_id.into(),
            status: ChainStatus::Created,
            started_at,
            completed_at: None,
            duration_seconds: 0.0,
            steps: Vec::new(),
            failed_step: None,
            error: None,
            cache: SyncContextStats::default(),
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn steps_with_status(&self, status: StepStatus) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(move |step| step.status == status)
    }

    pub fn records_processed(&self) -> u64 {
        self.steps.iter().map(|step| step.records_processed).sum()
    }

    pub fn failure(&self) -> Option<CoreError> {
        if self.status != ChainStatus::Failed {
            return None;
        }
        let step = self.failed_step.clone();
        let message = match (&step, &self.error) {
            (Some(step), Some(error)) => format!("required step '{step}' failed: {error}"),
            (Some(step), None) => format!("required step '{step}' failed"),
            (None, Some(error)) => error.clone(),
            (None, None) => format!("chain '{}' failed", self.chain_id),
        };
        Some(CoreError {
            task: Some(TaskKind::DailySyncChain),
            step,
            kind: CoreErrorKind::StepFailure,
            message,
        })
    }

    /// Propagates a required-step failure to the caller.
    pub fn into_result(self) -> CoreResult<ChainRun> {
        match self.failure() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}
