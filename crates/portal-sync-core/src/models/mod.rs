pub mod chain;
pub mod config;
pub mod error;
pub mod progress;
pub mod run_history;
pub mod task;

pub use chain::{ChainRun, ChainStatus, StepResult, StepStatus, SyncContextStats};
pub use config::{
    ChainTaskConfig, CrmPushConfig, CrmSyncType, EntitySyncConfig, HistoryCleanupConfig,
    SyncMode, SyncWindow, TaskConfig,
};
pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use progress::TaskProgress;
pub use run_history::{NewTaskRun, RecoveryReport, RunCompletion, RunStatus, TaskRunRecord};
pub use task::{TaskDefinition, TaskKind, TaskSchedule, TaskStatus, TaskSummary};
