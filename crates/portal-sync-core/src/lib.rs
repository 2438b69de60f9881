pub mod catalog;
pub mod config;
pub mod engine;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod schedule;
pub mod sqlite;
pub mod sync_policy;

pub use config::SchedulerConfig;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use models::{CoreError, CoreErrorKind, CoreResult};
