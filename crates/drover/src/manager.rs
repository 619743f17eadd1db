//! The task manager: registry, pool and the poll loop tied together.

use crate::claim::{ClaimStats, TaskClaimer};
use crate::pool::TaskPool;
use crate::registry::{TaskDefinition, TaskHandler, TaskTypeRegistry};
use crate::runner::TaskRunner;
use crate::scheduling::TaskScheduling;
use drover_core::{observe, Result, TaskManagerConfig, TaskManagerError, TaskStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub claim: ClaimStats,
    /// Claimed tasks handed to the pool.
    pub started: usize,
    /// Claimed tasks the pool refused; their claim expires and they are
    /// picked up again later.
    pub deferred: usize,
}

/// One task manager process.
///
/// Polls the store for due tasks, claims what fits into the pool and runs
/// it. Several managers with distinct owner ids may share one store.
#[derive(Clone)]
pub struct TaskManager {
    registry: TaskTypeRegistry,
    config: Arc<TaskManagerConfig>,
    pool: TaskPool,
    owner_id: String,
    claimer: TaskClaimer,
    runner: TaskRunner,
    scheduling: TaskScheduling,
    run_soon: Arc<Notify>,
    shutdown: CancellationToken,
}

impl TaskManager {
    /// Create a new manager builder.
    pub fn builder(store: Arc<dyn TaskStore>) -> TaskManagerBuilder {
        TaskManagerBuilder::new(store)
    }

    /// Handle for scheduling and managing tasks.
    pub fn scheduling(&self) -> &TaskScheduling {
        &self.scheduling
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    pub fn registry(&self) -> &TaskTypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    /// Claim once and start every claimed task the pool admits.
    ///
    /// Returns as soon as the runs are spawned.
    pub async fn poll_once(&self) -> Result<PollStats> {
        let claimed = self.claimer.claim(&self.pool).await?;
        let mut stats = PollStats {
            claim: claimed.stats,
            ..PollStats::default()
        };

        for task in claimed.tasks {
            let Some(definition) = self.registry.definition(&task.task_type) else {
                continue;
            };
            let task_id = task.id.clone();
            let runner = self.runner.clone();
            let work = {
                let task_id = task_id.clone();
                async move {
                    match runner.run(task).await {
                        Ok(outcome) => {
                            debug!(task_id = %task_id, outcome = outcome.as_str(), "Run done")
                        }
                        Err(e) => error!(task_id = %task_id, error = %e, "Run aborted"),
                    }
                }
            };

            match self.pool.run(definition, work) {
                Ok(_handle) => stats.started += 1,
                Err(rejection) => {
                    debug!(task_id = %task_id, reason = %rejection, "Pool refused claimed task");
                    stats.deferred += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Run the poll loop until [`TaskManager::shutdown`] is called.
    ///
    /// A poll happens after the poll interval, when capacity frees up, or
    /// when a run is requested. Failed claim cycles stretch the interval by
    /// a fifth each time up to `max_poll_interval`. On shutdown the loop
    /// stops claiming and waits for running tasks.
    pub async fn run(&self) -> Result<()> {
        info!(
            owner_id = %self.owner_id,
            capacity = self.pool.capacity(),
            task_types = ?self.registry.task_types(),
            "Task manager starting"
        );

        let base = self.config.poll_interval();
        let max = self.config.max_poll_interval();
        let mut delay = base;

        while !self.shutdown.is_cancelled() {
            let backing_off = match self.poll_once().await {
                Ok(stats) => {
                    delay = base;
                    if stats.claim.claimed > 0 {
                        debug!(
                            claimed = stats.claim.claimed,
                            started = stats.started,
                            deferred = stats.deferred,
                            "Poll finished"
                        );
                    }
                    false
                }
                Err(e) => {
                    observe::record_claim_error();
                    delay = next_poll_delay(delay, max);
                    warn!(error = %e, next_poll = ?delay, "Claim cycle failed");
                    true
                }
            };

            if backing_off {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.pool.capacity_freed() => {}
                    _ = self.run_soon.notified() => {}
                }
            }
        }

        info!(
            running = self.pool.total_running(),
            "Task manager shutting down, waiting for running tasks"
        );
        self.pool.wait_for_idle().await;
        info!("Task manager stopped");
        Ok(())
    }

    /// Signal graceful shutdown.
    pub fn shutdown(&self) {
        info!("Shutdown signal received");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn next_poll_delay(current: Duration, max: Duration) -> Duration {
    (current.saturating_mul(6) / 5).min(max)
}

/// Builder for creating a task manager.
pub struct TaskManagerBuilder {
    store: Arc<dyn TaskStore>,
    tasks: Vec<(TaskDefinition, Arc<dyn TaskHandler>)>,
    config: TaskManagerConfig,
    owner_id: Option<String>,
}

impl TaskManagerBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            tasks: Vec::new(),
            config: TaskManagerConfig::default(),
            owner_id: None,
        }
    }

    /// Register a handler under an explicit definition.
    pub fn with_task(
        mut self,
        definition: TaskDefinition,
        handler: impl TaskHandler + 'static,
    ) -> Self {
        let handler: Arc<dyn TaskHandler> = Arc::new(handler);
        self.tasks.push((definition, handler));
        self
    }

    /// Register a handler with default definition settings.
    pub fn with_task_handler(self, handler: impl TaskHandler + 'static) -> Self {
        let definition = TaskDefinition::new(handler.task_type());
        self.with_task(definition, handler)
    }

    pub fn with_config(mut self, config: TaskManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Identity written into claimed tasks. Defaults to a random UUID.
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Build the manager.
    pub fn build(self) -> Result<TaskManager> {
        self.config.validate()?;

        let mut registry = TaskTypeRegistry::new();
        for (definition, handler) in self.tasks {
            if definition.cost.units() > self.config.capacity {
                return Err(TaskManagerError::InvalidTask(format!(
                    "task type '{}' costs {} units, more than the capacity of {}",
                    definition.task_type,
                    definition.cost.units(),
                    self.config.capacity
                )));
            }
            registry.register(definition, handler)?;
        }

        let owner_id = self
            .owner_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let config = Arc::new(self.config);
        let pool = TaskPool::new(config.capacity);
        let run_soon = Arc::new(Notify::new());

        let claimer = TaskClaimer::new(
            self.store.clone(),
            registry.clone(),
            config.clone(),
            owner_id.clone(),
        );
        let runner = TaskRunner::new(
            self.store.clone(),
            registry.clone(),
            config.clone(),
            owner_id.clone(),
        );
        let scheduling = TaskScheduling::new(
            self.store,
            registry.clone(),
            config.clone(),
            pool.clone(),
            owner_id.clone(),
            run_soon.clone(),
        );

        Ok(TaskManager {
            registry,
            config,
            pool,
            owner_id,
            claimer,
            runner,
            scheduling,
            run_soon,
            shutdown: CancellationToken::new(),
        })
    }
}
