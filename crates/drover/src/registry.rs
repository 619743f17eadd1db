//! Task handler trait, task type definitions and the registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_core::{
    ConcreteTaskInstance, Result, Schedule, TaskCost, TaskManagerConfig, TaskManagerError,
    TaskPriority,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Context handed to a handler for one execution.
#[derive(Debug, Clone)]
pub struct RunContext {
    task: ConcreteTaskInstance,
    cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(task: ConcreteTaskInstance, cancellation: CancellationToken) -> Self {
        Self { task, cancellation }
    }

    /// The task document as it was when the run started.
    pub fn task(&self) -> &ConcreteTaskInstance {
        &self.task
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    pub fn params(&self) -> &Value {
        &self.task.params
    }

    pub fn state(&self) -> &Value {
        &self.task.state
    }

    /// Failed attempts before this one.
    pub fn attempts(&self) -> u32 {
        self.task.attempts
    }

    /// Set once the run has timed out. Handlers that want to stop early poll
    /// this or await [`RunContext::cancelled`].
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }
}

/// What a successful run asks the scheduler to do next.
///
/// The default result keeps the schedule: recurring tasks get their next
/// occurrence, one-shot tasks are removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    /// Replaces the task state when set.
    pub state: Option<Value>,
    /// Explicit next run, overriding the schedule.
    pub run_at: Option<DateTime<Utc>>,
    /// Replaces the task's schedule from this run on.
    pub schedule: Option<Schedule>,
    /// Remove the task even if it is recurring.
    pub delete_task: bool,
}

impl RunResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn delete(mut self) -> Self {
        self.delete_task = true;
        self
    }
}

/// Handler failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskRunError {
    /// Counts as a failed attempt and is retried with backoff, or at
    /// `retry_at` when the handler supplies one.
    #[error("{message}")]
    Retryable {
        message: String,
        retry_at: Option<DateTime<Utc>>,
    },

    /// Fails the task immediately without retrying.
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),
}

impl TaskRunError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_at: None,
        }
    }

    pub fn retry_at(message: impl Into<String>, retry_at: DateTime<Utc>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_at: Some(retry_at),
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable(message.into())
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

impl From<anyhow::Error> for TaskRunError {
    fn from(error: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", error))
    }
}

/// Trait implemented by task handlers.
///
/// One handler serves every task of its type. Cancellation is cooperative:
/// a timed-out run is abandoned, not aborted, so long-running handlers
/// should watch [`RunContext::is_cancelled`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Returns the task type this handler processes.
    fn task_type(&self) -> &str;

    /// Execute one run of the task.
    async fn run(&self, ctx: &RunContext) -> std::result::Result<RunResult, TaskRunError>;

    /// Called after a run exceeded its timeout, once the context's
    /// cancellation token has fired.
    async fn cancel(&self, _ctx: &RunContext) {}

    /// Validate task params (optional).
    ///
    /// Called when scheduling a task. Default implementation always succeeds.
    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }
}

/// Static properties of a task type.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub task_type: String,
    pub title: Option<String>,
    /// Run timeout; falls back to the manager's default.
    pub timeout: Option<Duration>,
    /// Attempts before the task turns terminal; falls back to the manager's default.
    pub max_attempts: Option<u32>,
    /// Instances of this type allowed to run at once on one manager.
    pub max_concurrency: Option<u32>,
    pub cost: TaskCost,
    pub priority: TaskPriority,
}

impl TaskDefinition {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            title: None,
            timeout: None,
            max_attempts: None,
            max_concurrency: None,
            cost: TaskCost::default(),
            priority: TaskPriority::default(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_cost(mut self, cost: TaskCost) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(&self, config: &TaskManagerConfig) -> Duration {
        self.timeout.unwrap_or_else(|| config.default_timeout())
    }

    pub fn max_attempts(&self, config: &TaskManagerConfig) -> u32 {
        self.max_attempts.unwrap_or(config.max_attempts)
    }
}

/// A definition paired with its handler.
#[derive(Clone)]
pub struct RegisteredTask {
    pub definition: TaskDefinition,
    pub handler: Arc<dyn TaskHandler>,
}

/// Registry of task types, built once and shared read-only.
#[derive(Clone, Default)]
pub struct TaskTypeRegistry {
    tasks: Arc<HashMap<String, RegisteredTask>>,
}

impl TaskTypeRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its definition.
    pub fn register(
        &mut self,
        definition: TaskDefinition,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<()> {
        if definition.task_type.is_empty() {
            return Err(TaskManagerError::InvalidTask(
                "task type must not be empty".into(),
            ));
        }
        if handler.task_type() != definition.task_type {
            return Err(TaskManagerError::InvalidTask(format!(
                "handler for '{}' registered under task type '{}'",
                handler.task_type(),
                definition.task_type
            )));
        }
        if definition.max_concurrency == Some(0) || definition.max_attempts == Some(0) {
            return Err(TaskManagerError::InvalidTask(format!(
                "task type '{}' must allow at least one run and one attempt",
                definition.task_type
            )));
        }

        let tasks = Arc::make_mut(&mut self.tasks);
        if tasks.contains_key(&definition.task_type) {
            return Err(TaskManagerError::InvalidTask(format!(
                "task type '{}' is already registered",
                definition.task_type
            )));
        }
        tasks.insert(
            definition.task_type.clone(),
            RegisteredTask {
                definition,
                handler,
            },
        );
        Ok(())
    }

    /// Get a registered task type.
    pub fn get(&self, task_type: &str) -> Result<&RegisteredTask> {
        self.tasks
            .get(task_type)
            .ok_or_else(|| TaskManagerError::UnregisteredTaskType(task_type.to_string()))
    }

    pub fn definition(&self, task_type: &str) -> Option<&TaskDefinition> {
        self.tasks.get(task_type).map(|task| &task.definition)
    }

    /// Check if a task type is registered.
    pub fn has(&self, task_type: &str) -> bool {
        self.tasks.contains_key(task_type)
    }

    /// All registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.tasks.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values().map(|task| &task.definition)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    #[async_trait]
    impl TaskHandler for Noop {
        fn task_type(&self) -> &str {
            self.0
        }

        async fn run(&self, _ctx: &RunContext) -> std::result::Result<RunResult, TaskRunError> {
            Ok(RunResult::new())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TaskTypeRegistry::new();
        registry
            .register(
                TaskDefinition::new("report").with_cost(TaskCost::Tiny),
                Arc::new(Noop("report")),
            )
            .unwrap();

        assert!(registry.has("report"));
        assert_eq!(registry.get("report").unwrap().definition.cost, TaskCost::Tiny);
        assert!(matches!(
            registry.get("missing"),
            Err(TaskManagerError::UnregisteredTaskType(_))
        ));
        assert_eq!(registry.task_types(), vec!["report".to_string()]);
    }

    #[test]
    fn test_register_rejects_duplicates_and_mismatches() {
        let mut registry = TaskTypeRegistry::new();
        registry
            .register(TaskDefinition::new("report"), Arc::new(Noop("report")))
            .unwrap();

        assert!(registry
            .register(TaskDefinition::new("report"), Arc::new(Noop("report")))
            .is_err());
        assert!(registry
            .register(TaskDefinition::new("email"), Arc::new(Noop("report")))
            .is_err());
        assert!(registry
            .register(
                TaskDefinition::new("zero").with_max_concurrency(0),
                Arc::new(Noop("zero"))
            )
            .is_err());
    }

    #[test]
    fn test_definition_falls_back_to_config() {
        let config = TaskManagerConfig::new().with_max_attempts(5);
        let def = TaskDefinition::new("report");
        assert_eq!(def.max_attempts(&config), 5);
        assert_eq!(def.timeout(&config), config.default_timeout());

        let def = def.with_max_attempts(2).with_timeout(Duration::from_secs(1));
        assert_eq!(def.max_attempts(&config), 2);
        assert_eq!(def.timeout(&config), Duration::from_secs(1));
    }

    #[test]
    fn test_anyhow_errors_are_retryable() {
        let err: TaskRunError = anyhow::anyhow!("connection reset").into();
        assert!(!err.is_unrecoverable());
        assert_eq!(err.to_string(), "connection reset");
    }
}
