pub mod adapters;
pub mod chain;
pub mod detached;
pub mod executor;
pub mod registry;
pub mod scheduler;
pub mod sync_context;

pub use adapters::{
    AdapterRegistry, AlertSink, LogAlertSink, SyncAdapter, TaskInvocation, TaskOutcome,
};
pub use chain::{ChainOptions, ChainOrchestrator, ChainPlan, ChainStep};
pub use detached::DetachedTasks;
pub use executor::{ExecutorSettings, LifecycleOutput, LifecycleScope, TaskExecutor};
pub use registry::{ProgressReporter, RunningTask, RunningTaskGuard, RunningTaskRegistry};
pub use scheduler::Scheduler;
pub use sync_context::{SyncContext, SyncContextGuard, SyncContextRegistry, fetch_cached};
