//! Convenience re-exports for common types.

pub use crate::{
    ConcreteTaskInstance, Result, Schedule, TaskCost, TaskInstance, TaskManagerConfig,
    TaskManagerError, TaskPriority, TaskQuery, TaskStatus, TaskStore,
};

// Configs
pub use crate::{ClaimOrdering, SqliteStoreConfig};

// Handlers
pub use crate::{RunContext, RunResult, TaskDefinition, TaskHandler, TaskRunError};

// Manager and scheduling
pub use crate::{
    EphemeralRunResult, EphemeralTask, PollStats, TaskManager, TaskManagerBuilder, TaskScheduling,
};

// Re-export common external deps
pub use async_trait::async_trait;
pub use std::sync::Arc;
