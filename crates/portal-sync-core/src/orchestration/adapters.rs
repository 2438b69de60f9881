use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::models::{CoreError, CoreErrorKind, CoreResult, SyncWindow, TaskConfig, TaskKind};
use crate::orchestration::registry::ProgressReporter;
use crate::orchestration::sync_context::SyncContext;

/// Everything an adapter receives for one run.
pub struct TaskInvocation {
    pub kind: TaskKind,
    pub config: TaskConfig,
    pub window: SyncWindow,
    pub progress: ProgressReporter,
    /// Present only while the run is a step of a chain.
    pub context: Option<Arc<SyncContext>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub records_processed: u64,
    pub summary: Value,
}

impl TaskOutcome {
    pub fn new(records_processed: u64, summary: Value) -> Self {
        Self {
            records_processed,
            summary,
        }
    }
}

/// Entity-specific sync logic for one task kind, supplied by the host
/// application.
#[async_trait]
pub trait SyncAdapter: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn execute(&self, invocation: TaskInvocation) -> CoreResult<TaskOutcome>;
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<TaskKind, Arc<dyn SyncAdapter>>,
}

impl AdapterRegistry {
    pub fn new(adapters: impl IntoIterator<Item = Arc<dyn SyncAdapter>>) -> CoreResult<Self> {
        let mut registry = Self::default();
        for adapter in adapters {
            registry.register(adapter)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn SyncAdapter>) -> CoreResult<()> {
        let kind = adapter.kind();
        if kind.is_builtin() {
            return Err(CoreError::for_task(
                kind,
                CoreErrorKind::InvalidInput,
                format!("task '{kind}' is executed by the engine and cannot take an adapter"),
            ));
        }
        if self.adapters.contains_key(&kind) {
            return Err(CoreError::for_task(
                kind,
                CoreErrorKind::InvalidInput,
                format!("duplicate adapter registration for task '{kind}'"),
            ));
        }
        self.adapters.insert(kind, adapter);
        Ok(())
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn SyncAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn has_adapter(&self, kind: TaskKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Outbound notification of a failed run.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_sync_error_alert(
        &self,
        task_name: &str,
        error_message: &str,
        duration_seconds: f64,
    ) -> CoreResult<()>;
}

/// Alert sink that only writes to the log.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_sync_error_alert(
        &self,
        task_name: &str,
        error_message: &str,
        duration_seconds: f64,
    ) -> CoreResult<()> {
        tracing::warn!(
            task_name,
            error_message,
            duration_seconds,
            "sync task failed"
        );
        Ok(())
    }
}
