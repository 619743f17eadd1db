//! Error types for the task manager.

use crate::task::TaskStatus;
use thiserror::Error;

/// Result type for task manager operations.
pub type Result<T> = std::result::Result<T, TaskManagerError>;

/// Errors that can occur while scheduling, claiming or running tasks.
#[derive(Debug, Error)]
pub enum TaskManagerError {
    /// Malformed interval string or structurally invalid recurrence rule.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The stored document changed since it was read.
    #[error("Version conflict on task {id}")]
    VersionConflict { id: String },

    /// No definition is registered for this task type.
    #[error("Unregistered task type: {0}")]
    UnregisteredTaskType(String),

    /// The task is claimed or running and cannot be manipulated right now.
    #[error("Task {id} is not idle (status: {status})")]
    TaskNotIdle { id: String, status: TaskStatus },

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A task with this id already exists.
    #[error("Task already exists: {0}")]
    TaskAlreadyExists(String),

    /// The task is disabled.
    #[error("Task is disabled: {0}")]
    TaskDisabled(String),

    /// The pool has no room for the task right now.
    #[error("Insufficient capacity to run task of type {task_type}")]
    CapacityExhausted { task_type: String },

    /// Invalid task configuration.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Invalid task manager configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The backing document store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cron parsing error.
    #[error("Cron parsing error: {0}")]
    CronParse(#[from] cron::error::Error),

    /// An ephemeral run finished with a handler error.
    #[error("Task run failed: {0}")]
    TaskRunFailed(String),
}

impl TaskManagerError {
    /// True when the error is an optimistic-concurrency conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// True when the error reports a missing document.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound(_))
    }
}
