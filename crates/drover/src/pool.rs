//! Cost-weighted admission control for running tasks.

use crate::registry::TaskDefinition;
use drover_core::observe;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Why the pool refused a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolRejection {
    #[error("task needs {required} cost units, {available} available")]
    InsufficientCapacity { required: u32, available: u32 },

    #[error("task type {task_type} is at its concurrency limit of {limit}")]
    ConcurrencyLimit { task_type: String, limit: u32 },
}

#[derive(Debug, Default)]
struct PoolState {
    used: u32,
    running: HashMap<String, u32>,
}

#[derive(Debug)]
struct PoolInner {
    capacity: u32,
    state: Mutex<PoolState>,
    /// Single stored wakeup for the poll loop.
    freed: Notify,
    /// Broadcast to `wait_for_idle` callers.
    released: Notify,
}

/// RAII guard holding a task's cost in the pool.
///
/// Dropping it returns the cost and fires the drain trigger.
pub struct PoolPermit {
    inner: Arc<PoolInner>,
    task_type: String,
    cost: u32,
}

impl std::fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPermit")
            .field("task_type", &self.task_type)
            .field("cost", &self.cost)
            .finish()
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.used = state.used.saturating_sub(self.cost);
            if let Some(count) = state.running.get_mut(&self.task_type) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.running.remove(&self.task_type);
                }
            }
            observe::set_pool_used_capacity(state.used);
        }
        self.inner.freed.notify_one();
        self.inner.released.notify_waiters();
    }
}

/// Gate for concurrent execution.
///
/// Tracks a total cost budget and per-type running counts. Admission either
/// succeeds immediately or is refused; the pool never queues.
#[derive(Debug, Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl TaskPool {
    /// Create a pool with `capacity` cost units.
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                state: Mutex::new(PoolState::default()),
                freed: Notify::new(),
                released: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Free cost units.
    pub fn available_capacity(&self) -> u32 {
        let state = self.inner.state.lock();
        self.inner.capacity.saturating_sub(state.used)
    }

    pub fn used_capacity(&self) -> u32 {
        self.inner.state.lock().used
    }

    /// Running instances of `task_type`.
    pub fn running_count(&self, task_type: &str) -> u32 {
        self.inner
            .state
            .lock()
            .running
            .get(task_type)
            .copied()
            .unwrap_or(0)
    }

    /// Running instances across all types.
    pub fn total_running(&self) -> u32 {
        self.inner.state.lock().running.values().sum()
    }

    /// Reserve room for one instance of `definition`.
    pub fn try_admit(&self, definition: &TaskDefinition) -> Result<PoolPermit, PoolRejection> {
        let cost = definition.cost.units();
        let mut state = self.inner.state.lock();

        let available = self.inner.capacity.saturating_sub(state.used);
        if cost > available {
            return Err(PoolRejection::InsufficientCapacity {
                required: cost,
                available,
            });
        }

        let running = state
            .running
            .get(&definition.task_type)
            .copied()
            .unwrap_or(0);
        if let Some(limit) = definition.max_concurrency {
            if running >= limit {
                return Err(PoolRejection::ConcurrencyLimit {
                    task_type: definition.task_type.clone(),
                    limit,
                });
            }
        }

        state.used += cost;
        state
            .running
            .insert(definition.task_type.clone(), running + 1);
        observe::set_pool_used_capacity(state.used);

        Ok(PoolPermit {
            inner: self.inner.clone(),
            task_type: definition.task_type.clone(),
            cost,
        })
    }

    /// Admit and spawn `work`, releasing its cost when it finishes.
    ///
    /// Refused work is not executed; the caller leaves the task for a later cycle.
    pub fn run<F>(
        &self,
        definition: &TaskDefinition,
        work: F,
    ) -> Result<JoinHandle<F::Output>, PoolRejection>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.try_admit(definition)?;
        Ok(tokio::spawn(async move {
            let _permit = permit;
            work.await
        }))
    }

    /// Resolves after some running task released its cost.
    ///
    /// A release that happens while nobody waits is remembered for the next call.
    pub async fn capacity_freed(&self) {
        self.inner.freed.notified().await;
    }

    /// Wait until nothing is running.
    pub async fn wait_for_idle(&self) {
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.inner.state.lock().used == 0 {
                return;
            }
            released.await;
        }
    }
}
