//! Execution of a single claimed task.

use crate::registry::{
    RegisteredTask, RunContext, RunResult, TaskDefinition, TaskRunError, TaskTypeRegistry,
};
use chrono::{DateTime, Utc};
use drover_core::{
    observe, ConcreteTaskInstance, Result, TaskManagerConfig, TaskManagerError, TaskStatus,
    TaskStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a run ended, as written back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunOutcome {
    /// Recurring success or explicit `run_at`: idle again with a future `run_at`.
    Rescheduled,
    /// One-shot success, exhausted schedule or explicit deletion: removed.
    Completed,
    /// Failed attempt with attempts left: idle at the backoff time.
    RetryScheduled,
    /// Terminal failure.
    Failed,
    /// Not executed.
    Skipped,
    /// Another owner holds the task, or it was removed mid-run.
    OwnershipLost,
}

impl TaskRunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rescheduled => "rescheduled",
            Self::Completed => "completed",
            Self::RetryScheduled => "retry_scheduled",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::OwnershipLost => "ownership_lost",
        }
    }
}

/// Execute the handler under `timeout`.
///
/// The handler runs on its own tokio task so a panic is reported as a
/// failed attempt. On timeout the context is cancelled, the handler's
/// `cancel` hook runs for at most another `timeout`, and the spawned run is
/// left to finish on its own.
pub(crate) async fn invoke_handler(
    registered: &RegisteredTask,
    ctx: RunContext,
    cancellation: CancellationToken,
    timeout: Duration,
) -> std::result::Result<RunResult, TaskRunError> {
    let handler = registered.handler.clone();
    let run_ctx = ctx.clone();
    let mut handle = tokio::spawn(async move { handler.run(&run_ctx).await });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(TaskRunError::retryable(format!(
            "Task panicked: {}",
            join_error
        ))),
        Err(_elapsed) => {
            cancellation.cancel();
            if tokio::time::timeout(timeout, registered.handler.cancel(&ctx))
                .await
                .is_err()
            {
                warn!(task_id = %ctx.task_id(), "Cancel hook did not return in time");
            }
            Err(TaskRunError::retryable(format!(
                "Task timed out after {:?}",
                timeout
            )))
        }
    }
}

/// Runs claimed tasks and writes their follow-up state.
#[derive(Clone)]
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    registry: TaskTypeRegistry,
    config: Arc<TaskManagerConfig>,
    owner_id: String,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: TaskTypeRegistry,
        config: Arc<TaskManagerConfig>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            owner_id: owner_id.into(),
        }
    }

    /// Run a task this owner has claimed.
    ///
    /// Handler errors never escape: they become task state. Errors returned
    /// here are store failures or an unregistered task type.
    pub async fn run(&self, task: ConcreteTaskInstance) -> Result<TaskRunOutcome> {
        let registered = self.registry.get(&task.task_type)?;
        let definition = &registered.definition;
        let timeout = definition.timeout(&self.config);

        if task.owner_id.as_deref() != Some(self.owner_id.as_str()) {
            warn!(
                task_id = %task.id,
                owner_id = ?task.owner_id,
                "Refusing to run a task claimed by another owner"
            );
            return Ok(TaskRunOutcome::Skipped);
        }

        let started_at = Utc::now();
        let mut running = task;
        running.status = TaskStatus::Running;
        running.started_at = Some(started_at);
        running.retry_at = Some(offset(started_at, timeout));

        let running = match self.store.update(&running).await {
            Ok(updated) => updated,
            Err(e) if e.is_version_conflict() || e.is_not_found() => {
                warn!(
                    task_id = %running.id,
                    task_type = %running.task_type,
                    error = %e,
                    "Claim lost before the task started"
                );
                return Ok(TaskRunOutcome::OwnershipLost);
            }
            Err(e) => return Err(e),
        };

        debug!(
            task_id = %running.id,
            task_type = %running.task_type,
            attempts = running.attempts,
            "Starting task run"
        );

        let clock = Instant::now();
        let cancellation = CancellationToken::new();
        let ctx = RunContext::new(running.clone(), cancellation.clone());
        let result = invoke_handler(registered, ctx, cancellation, timeout).await;

        let outcome = match result {
            Ok(run_result) => self.on_success(running, run_result, started_at).await?,
            Err(run_error) => self.on_failure(running, run_error, definition).await?,
        };

        observe::record_task_run(&definition.task_type, outcome.as_str(), clock.elapsed());
        Ok(outcome)
    }

    async fn on_success(
        &self,
        mut task: ConcreteTaskInstance,
        result: RunResult,
        started_at: DateTime<Utc>,
    ) -> Result<TaskRunOutcome> {
        if let Some(state) = result.state {
            task.state = state;
        }
        if let Some(schedule) = result.schedule {
            task.schedule = Some(schedule);
        }
        task.attempts = 0;

        if result.delete_task {
            return self.complete(task).await;
        }

        let now = Utc::now();
        let schedule = task.schedule.clone();
        let next_run = match (result.run_at, schedule) {
            (Some(run_at), _) => Some(run_at),
            (None, Some(schedule)) => {
                let reference = self.schedule_reference(&task, started_at, now);
                match schedule.next_run_at(reference, now) {
                    Ok(next) => next,
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "Cannot compute next run");
                        return self.on_failure_terminal(task, &e.to_string()).await;
                    }
                }
            }
            (None, None) => None,
        };

        let Some(next_run) = next_run else {
            return self.complete(task).await;
        };

        task.release_to_idle();
        task.scheduled_at = next_run;
        task.run_at = next_run;

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            run_at = %next_run,
            "Task succeeded, rescheduled"
        );
        self.write_back(task, TaskRunOutcome::Rescheduled).await
    }

    /// Reference time for the next occurrence: `run_at` for punctual runs
    /// when precise scheduling is on, otherwise the completion time.
    fn schedule_reference(
        &self,
        task: &ConcreteTaskInstance,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let threshold = self.config.precise_scheduling_threshold();
        if threshold.is_zero() {
            return now;
        }
        let delay = (started_at - task.run_at).to_std().unwrap_or(Duration::ZERO);
        if delay < threshold {
            task.run_at
        } else {
            now
        }
    }

    async fn on_failure(
        &self,
        mut task: ConcreteTaskInstance,
        run_error: TaskRunError,
        definition: &TaskDefinition,
    ) -> Result<TaskRunOutcome> {
        let max_attempts = definition.max_attempts(&self.config);
        task.attempts = task.attempts.saturating_add(1);

        let retry_at = match run_error {
            TaskRunError::Unrecoverable(ref message) => {
                // Exhaust the attempts so the failed clause of the claim query skips it.
                task.attempts = task.attempts.max(max_attempts);
                return self.on_failure_terminal(task, message).await;
            }
            TaskRunError::Retryable { retry_at, .. } => retry_at,
        };

        if task.attempts >= max_attempts {
            return self.on_failure_terminal(task, &run_error.to_string()).await;
        }

        let run_at = retry_at
            .unwrap_or_else(|| offset(Utc::now(), self.config.backoff_delay(task.attempts)));

        warn!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempts = task.attempts,
            max_attempts,
            run_at = %run_at,
            error = %run_error,
            "Task failed, retry scheduled"
        );

        task.release_to_idle();
        task.run_at = run_at;
        self.write_back(task, TaskRunOutcome::RetryScheduled).await
    }

    async fn on_failure_terminal(
        &self,
        mut task: ConcreteTaskInstance,
        message: &str,
    ) -> Result<TaskRunOutcome> {
        error!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempts = task.attempts,
            error = %message,
            "Task failed permanently"
        );
        task.release_to_idle();
        task.status = TaskStatus::Failed;
        self.write_back(task, TaskRunOutcome::Failed).await
    }

    async fn complete(&self, task: ConcreteTaskInstance) -> Result<TaskRunOutcome> {
        match self.store.remove(&task.id, Some(&task.version)).await {
            Ok(()) => {
                info!(task_id = %task.id, task_type = %task.task_type, "Task completed");
                Ok(TaskRunOutcome::Completed)
            }
            Err(e) => self.terminal_write_failed(&task, e),
        }
    }

    async fn write_back(
        &self,
        task: ConcreteTaskInstance,
        outcome: TaskRunOutcome,
    ) -> Result<TaskRunOutcome> {
        match self.store.update(&task).await {
            Ok(_) => Ok(outcome),
            Err(e) => self.terminal_write_failed(&task, e),
        }
    }

    fn terminal_write_failed(
        &self,
        task: &ConcreteTaskInstance,
        e: TaskManagerError,
    ) -> Result<TaskRunOutcome> {
        match e {
            TaskManagerError::TaskNotFound(_) => {
                warn!(task_id = %task.id, "Task was removed while running");
                Ok(TaskRunOutcome::OwnershipLost)
            }
            TaskManagerError::VersionConflict { .. } => {
                error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    owner_id = %self.owner_id,
                    "Ownership anomaly: task changed under its running owner"
                );
                Ok(TaskRunOutcome::OwnershipLost)
            }
            other => Err(other),
        }
    }
}

/// `at + duration`, saturating at the end of the calendar.
pub(crate) fn offset(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
