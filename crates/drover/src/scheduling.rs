//! Public operations for creating and managing tasks.

use crate::pool::TaskPool;
use crate::registry::{RunContext, RunResult, TaskTypeRegistry};
use crate::runner::invoke_handler;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use drover_core::{
    ConcreteTaskInstance, Result, Schedule, TaskInstance, TaskManagerConfig, TaskManagerError,
    TaskPage, TaskQuery, TaskStatus, TaskStore, Version,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A handler invocation that is never persisted.
#[derive(Debug, Clone)]
pub struct EphemeralTask {
    pub task_type: String,
    pub params: Value,
    pub state: Value,
    pub scope: Vec<String>,
    pub trace_id: Option<String>,
}

impl EphemeralTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            params: Value::Object(Default::default()),
            state: Value::Object(Default::default()),
            scope: Vec::new(),
            trace_id: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Result of a finished ephemeral run.
#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralRunResult {
    pub id: String,
    /// State after the run; the input state when the handler returned none.
    pub state: Value,
    pub run_result: RunResult,
}

/// Per-id results of a bulk operation.
pub type BulkResult<T> = BTreeMap<String, Result<T>>;

/// Handle for scheduling and manipulating tasks.
///
/// Cheap to clone; every clone talks to the same store and pool.
#[derive(Clone)]
pub struct TaskScheduling {
    store: Arc<dyn TaskStore>,
    registry: TaskTypeRegistry,
    config: Arc<TaskManagerConfig>,
    pool: TaskPool,
    owner_id: String,
    run_soon: Arc<Notify>,
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl TaskScheduling {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        registry: TaskTypeRegistry,
        config: Arc<TaskManagerConfig>,
        pool: TaskPool,
        owner_id: String,
        run_soon: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            pool,
            owner_id,
            run_soon,
        }
    }

    /// Validate an instance and turn it into a fresh idle document.
    fn prepare(&self, id: String, instance: TaskInstance) -> Result<ConcreteTaskInstance> {
        let registered = self.registry.get(&instance.task_type)?;
        if let Some(schedule) = &instance.schedule {
            schedule.validate()?;
        }
        registered.handler.validate(&instance.params)?;

        let run_at = instance.run_at.unwrap_or_else(Utc::now);
        Ok(ConcreteTaskInstance {
            id,
            task_type: instance.task_type,
            params: instance.params,
            state: instance.state,
            schedule: instance.schedule,
            scheduled_at: run_at,
            run_at,
            retry_at: None,
            started_at: None,
            status: TaskStatus::Idle,
            attempts: 0,
            owner_id: None,
            priority: instance
                .priority
                .unwrap_or_else(|| registered.definition.priority.value()),
            enabled: instance.enabled.unwrap_or(true),
            scope: instance.scope,
            trace_id: instance.trace_id,
            version: Version::default(),
        })
    }

    /// Create a new task. Fails with `TaskAlreadyExists` for a taken id.
    pub async fn schedule(&self, instance: TaskInstance) -> Result<ConcreteTaskInstance> {
        let id = instance.id.clone().unwrap_or_else(new_task_id);
        let task = self.prepare(id, instance)?;
        let created = self.store.create(task).await?;
        info!(
            task_id = %created.id,
            task_type = %created.task_type,
            run_at = %created.run_at,
            "Task scheduled"
        );
        Ok(created)
    }

    /// Create many tasks, reporting each separately.
    pub async fn bulk_schedule(
        &self,
        instances: Vec<TaskInstance>,
    ) -> BulkResult<ConcreteTaskInstance> {
        let mut results = BTreeMap::new();
        for instance in instances {
            let id = instance.id.clone().unwrap_or_else(new_task_id);
            let result = match self.prepare(id.clone(), instance) {
                Ok(task) => self.store.create(task).await,
                Err(e) => Err(e),
            };
            results.insert(id, result);
        }
        results
    }

    /// Create the task, or update the existing one with the same id in place.
    ///
    /// Params, schedule, scope, trace id, priority and `enabled` are taken
    /// from `instance`; run state is kept. Fails with `TaskNotIdle` while
    /// another owner holds a live claim.
    pub async fn ensure_scheduled(&self, instance: TaskInstance) -> Result<ConcreteTaskInstance> {
        let id = instance.id.clone().ok_or_else(|| {
            TaskManagerError::InvalidTask("ensure_scheduled requires a task id".into())
        })?;
        let task = self.prepare(id.clone(), instance.clone())?;

        match self.store.create(task).await {
            Ok(created) => {
                info!(task_id = %created.id, "Task scheduled");
                return Ok(created);
            }
            Err(TaskManagerError::TaskAlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        let mut existing = self.store.get(&id).await?;
        if existing.task_type != instance.task_type {
            return Err(TaskManagerError::InvalidTask(format!(
                "task {} has type '{}', not '{}'",
                id, existing.task_type, instance.task_type
            )));
        }
        if existing.status.is_owned() && !existing.claim_expired(Utc::now()) {
            return Err(TaskManagerError::TaskNotIdle {
                id,
                status: existing.status,
            });
        }

        existing.params = instance.params;
        existing.schedule = instance.schedule;
        existing.scope = instance.scope;
        existing.trace_id = instance.trace_id;
        if let Some(priority) = instance.priority {
            existing.priority = priority;
        }
        if let Some(enabled) = instance.enabled {
            existing.enabled = enabled;
        }

        let updated = self.store.update(&existing).await?;
        debug!(task_id = %updated.id, "Existing task updated in place");
        Ok(updated)
    }

    /// Make an idle or failed task due now and wake the local poller.
    ///
    /// A failed task starts over with zero attempts. Fails with
    /// `TaskNotIdle` while the task is claimed or running.
    pub async fn run_now(&self, id: &str) -> Result<ConcreteTaskInstance> {
        let mut task = self.store.get(id).await?;
        if !task.enabled {
            return Err(TaskManagerError::TaskDisabled(id.to_string()));
        }
        if task.status.is_owned() {
            return Err(TaskManagerError::TaskNotIdle {
                id: id.to_string(),
                status: task.status,
            });
        }
        self.registry.get(&task.task_type)?;

        if task.status != TaskStatus::Idle {
            task.attempts = 0;
        }
        task.release_to_idle();
        task.run_at = Utc::now();

        let updated = self.store.update(&task).await?;
        self.run_soon.notify_one();
        info!(task_id = %id, task_type = %updated.task_type, "Task run requested");
        Ok(updated)
    }

    /// Run a handler right away without a stored task.
    ///
    /// Takes capacity from the pool like any other run and fails with
    /// `CapacityExhausted` when there is none. Waits for the run to finish.
    pub async fn ephemeral_run_now(&self, task: EphemeralTask) -> Result<EphemeralRunResult> {
        let registered = self.registry.get(&task.task_type)?;
        registered.handler.validate(&task.params)?;

        let permit = self.pool.try_admit(&registered.definition).map_err(|rejection| {
            debug!(task_type = %task.task_type, reason = %rejection, "Ephemeral run refused");
            TaskManagerError::CapacityExhausted {
                task_type: task.task_type.clone(),
            }
        })?;

        let now = Utc::now();
        let timeout = registered.definition.timeout(&self.config);
        let instance = ConcreteTaskInstance {
            id: format!("ephemeral-{}", new_task_id()),
            task_type: task.task_type,
            params: task.params,
            state: task.state,
            schedule: None,
            scheduled_at: now,
            run_at: now,
            retry_at: None,
            started_at: Some(now),
            status: TaskStatus::Running,
            attempts: 0,
            owner_id: Some(self.owner_id.clone()),
            priority: registered.definition.priority.value(),
            enabled: true,
            scope: task.scope,
            trace_id: task.trace_id,
            version: Version::default(),
        };

        let id = instance.id.clone();
        let input_state = instance.state.clone();
        let cancellation = CancellationToken::new();
        let ctx = RunContext::new(instance, cancellation.clone());

        info!(task_id = %id, task_type = %registered.definition.task_type, "Ephemeral run");
        let result = invoke_handler(registered, ctx, cancellation, timeout).await;
        drop(permit);

        match result {
            Ok(run_result) => Ok(EphemeralRunResult {
                id,
                state: run_result.state.clone().unwrap_or(input_state),
                run_result,
            }),
            Err(e) => Err(TaskManagerError::TaskRunFailed(e.to_string())),
        }
    }

    /// Change the schedule of idle tasks.
    ///
    /// Moving between intervals shifts `run_at` by the difference, never
    /// into the past. Other schedule changes keep `run_at`.
    pub async fn bulk_update_schedules(
        &self,
        ids: &[String],
        schedule: Schedule,
    ) -> Result<BulkResult<ConcreteTaskInstance>> {
        schedule.validate()?;
        let now = Utc::now();
        let new_interval = schedule.interval_millis();

        let mut results = BTreeMap::new();
        let mut batch = Vec::new();
        for (id, fetched) in self.store.bulk_get(ids).await? {
            let mut task = match fetched {
                Ok(task) => task,
                Err(e) => {
                    results.insert(id, Err(e));
                    continue;
                }
            };
            if task.status != TaskStatus::Idle {
                results.insert(
                    id.clone(),
                    Err(TaskManagerError::TaskNotIdle {
                        id,
                        status: task.status,
                    }),
                );
                continue;
            }

            let old_interval = task.schedule.as_ref().and_then(Schedule::interval_millis);
            if let (Some(old), Some(new)) = (old_interval, new_interval) {
                task.run_at = shift_run_at(task.run_at, new - old, now);
            }
            task.schedule = Some(schedule.clone());
            batch.push(task);
        }

        results.extend(self.store.bulk_update(&batch).await?);
        Ok(results)
    }

    /// Enable tasks; with `run_soon` they also become due now.
    pub async fn bulk_enable(
        &self,
        ids: &[String],
        run_soon: bool,
    ) -> Result<BulkResult<ConcreteTaskInstance>> {
        let now = Utc::now();
        let results = self
            .bulk_modify(ids, |task| {
                if task.enabled && !run_soon {
                    return false;
                }
                task.enabled = true;
                if run_soon && !task.status.is_owned() {
                    task.run_at = now;
                    task.scheduled_at = now;
                }
                true
            })
            .await?;
        if run_soon {
            self.run_soon.notify_one();
        }
        Ok(results)
    }

    /// Disable tasks so no owner claims them.
    pub async fn bulk_disable(&self, ids: &[String]) -> Result<BulkResult<ConcreteTaskInstance>> {
        self.bulk_modify(ids, |task| {
            let changed = task.enabled;
            task.enabled = false;
            changed
        })
        .await
    }

    /// Apply `modify` to each found task; it returns whether anything changed.
    async fn bulk_modify<F>(
        &self,
        ids: &[String],
        mut modify: F,
    ) -> Result<BulkResult<ConcreteTaskInstance>>
    where
        F: FnMut(&mut ConcreteTaskInstance) -> bool,
    {
        let mut results = BTreeMap::new();
        let mut batch = Vec::new();
        for (id, fetched) in self.store.bulk_get(ids).await? {
            match fetched {
                Ok(mut task) => {
                    if modify(&mut task) {
                        batch.push(task);
                    } else {
                        results.insert(id, Ok(task));
                    }
                }
                Err(e) => {
                    results.insert(id, Err(e));
                }
            }
        }
        results.extend(self.store.bulk_update(&batch).await?);
        Ok(results)
    }

    /// Remove a task regardless of its state.
    ///
    /// A running owner notices at its terminal write.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.remove(id, None).await?;
        info!(task_id = %id, "Task removed");
        Ok(())
    }

    pub async fn bulk_remove(&self, ids: &[String]) -> BulkResult<()> {
        let mut results = BTreeMap::new();
        for id in ids {
            results.insert(id.clone(), self.remove(id).await);
        }
        results
    }

    pub async fn get(&self, id: &str) -> Result<ConcreteTaskInstance> {
        self.store.get(id).await
    }

    pub async fn fetch(&self, query: &TaskQuery) -> Result<TaskPage> {
        self.store.query(query).await
    }
}

/// `run_at + delta_ms`, but not before `now`.
fn shift_run_at(run_at: DateTime<Utc>, delta_ms: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    run_at
        .checked_add_signed(ChronoDuration::milliseconds(delta_ms))
        .unwrap_or(run_at)
        .max(now)
}
