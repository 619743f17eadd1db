//! The claim cycle: find due and expired tasks, mark them owned.

use crate::pool::TaskPool;
use crate::registry::TaskTypeRegistry;
use crate::runner::offset;
use chrono::{DateTime, Utc};
use drover_core::{
    observe, ClaimOrdering, ConcreteTaskInstance, Result, TaskClause, TaskManagerConfig,
    TaskQuery, TaskSort, TaskStatus, TaskStore,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Counters for one claim cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimStats {
    pub claimed: usize,
    /// Candidates another owner changed first.
    pub conflicts: usize,
    /// Candidates marked `unrecognized` this cycle.
    pub unrecognized: usize,
    pub pages: usize,
}

/// Tasks now owned by this process.
#[derive(Debug, Clone, Default)]
pub struct ClaimResult {
    pub tasks: Vec<ConcreteTaskInstance>,
    pub stats: ClaimStats,
}

/// Selects and claims tasks on behalf of one owner.
#[derive(Clone)]
pub struct TaskClaimer {
    store: Arc<dyn TaskStore>,
    registry: TaskTypeRegistry,
    config: Arc<TaskManagerConfig>,
    owner_id: String,
}

/// Remaining room during selection.
struct Budget {
    cost: u32,
    per_type: HashMap<String, u32>,
}

impl TaskClaimer {
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

    /// The search for claimable tasks at `now`.
    pub fn claim_query(&self, now: DateTime<Utc>) -> TaskQuery {
        let mut query = TaskQuery::new().or(TaskClause::new()
            .with_statuses([TaskStatus::Idle])
            .run_at_lte(now));

        for definition in self.registry.definitions() {
            query = query.or(TaskClause::new()
                .with_statuses([TaskStatus::Failed])
                .with_task_type(definition.task_type.clone())
                .attempts_lt(definition.max_attempts(&self.config))
                .run_at_lte(now));
        }

        let sort = match self.config.claim_ordering {
            ClaimOrdering::Priority => TaskSort::PriorityThenRunAt,
            ClaimOrdering::RoundRobin => TaskSort::RunAt,
        };

        query
            .or(TaskClause::new()
                .with_statuses([TaskStatus::Claiming, TaskStatus::Running])
                .retry_at_lt(now))
            .enabled_only()
            .excluding(self.config.exclude_task_types.iter().cloned())
            .sorted_by(sort)
            .with_size(self.config.claim_page_size)
    }

    /// Run one claim cycle against the pool's free capacity.
    ///
    /// Store errors abort the cycle; conflicts on individual tasks do not.
    pub async fn claim(&self, pool: &TaskPool) -> Result<ClaimResult> {
        let clock = Instant::now();
        let mut budget = Budget {
            cost: pool.available_capacity(),
            per_type: HashMap::new(),
        };
        if budget.cost == 0 {
            debug!(owner_id = %self.owner_id, "Pool is full, skipping claim cycle");
            return Ok(ClaimResult::default());
        }

        let now = Utc::now();
        let mut query = self.claim_query(now);
        let mut stats = ClaimStats::default();
        let mut to_claim = Vec::new();
        let mut to_mark = Vec::new();

        while stats.pages < self.config.claim_max_pages && budget.cost > 0 {
            let page = self.store.query(&query).await?;
            stats.pages += 1;

            let candidates = match self.config.claim_ordering {
                ClaimOrdering::Priority => page.tasks,
                ClaimOrdering::RoundRobin => interleave_by_type(page.tasks),
            };

            for task in candidates {
                if budget.cost == 0 {
                    break;
                }
                let Some(definition) = self.registry.definition(&task.task_type) else {
                    to_mark.push(task);
                    continue;
                };

                let cost = definition.cost.units();
                if cost > budget.cost {
                    continue;
                }
                if let Some(limit) = definition.max_concurrency {
                    let running = pool.running_count(&task.task_type);
                    let slots = budget
                        .per_type
                        .entry(task.task_type.clone())
                        .or_insert(limit.saturating_sub(running));
                    if *slots == 0 {
                        continue;
                    }
                    *slots -= 1;
                }
                budget.cost -= cost;
                to_claim.push(task);
            }

            match page.next {
                Some(cursor) => query.search_after = Some(cursor),
                None => break,
            }
        }

        let retry_at = offset(now, self.config.claim_timeout());
        let claim_count = to_claim.len();
        let mut batch: Vec<ConcreteTaskInstance> = to_claim
            .into_iter()
            .map(|mut task| {
                task.status = TaskStatus::Claiming;
                task.owner_id = Some(self.owner_id.clone());
                task.retry_at = Some(retry_at);
                task.started_at = None;
                task
            })
            .collect();
        batch.extend(to_mark.into_iter().map(|mut task| {
            task.release_to_idle();
            task.status = TaskStatus::Unrecognized;
            task
        }));

        let mut tasks = Vec::with_capacity(claim_count);
        if !batch.is_empty() {
            let results = self.store.bulk_update(&batch).await?;
            for (index, (id, result)) in results.into_iter().enumerate() {
                let is_claim = index < claim_count;
                match result {
                    Ok(task) if is_claim => tasks.push(task),
                    Ok(task) => {
                        warn!(
                            task_id = %id,
                            task_type = %task.task_type,
                            "Task type is not registered, marked unrecognized"
                        );
                        stats.unrecognized += 1;
                    }
                    Err(e) if e.is_version_conflict() || e.is_not_found() => {
                        debug!(task_id = %id, "Lost claim race");
                        stats.conflicts += 1;
                    }
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Failed to claim task");
                    }
                }
            }
        }

        stats.claimed = tasks.len();
        observe::record_claim_cycle(clock.elapsed(), stats.claimed, stats.conflicts);
        debug!(
            owner_id = %self.owner_id,
            claimed = stats.claimed,
            conflicts = stats.conflicts,
            unrecognized = stats.unrecognized,
            pages = stats.pages,
            "Claim cycle finished"
        );

        Ok(ClaimResult { tasks, stats })
    }
}

/// Reorder so consecutive picks rotate across task types, keeping each
/// type's own order.
pub fn interleave_by_type(tasks: Vec<ConcreteTaskInstance>) -> Vec<ConcreteTaskInstance> {
    let total = tasks.len();
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, VecDeque<ConcreteTaskInstance>> = HashMap::new();

    for task in tasks {
        if !groups.contains_key(&task.task_type) {
            order.push(task.task_type.clone());
        }
        groups
            .entry(task.task_type.clone())
            .or_default()
            .push_back(task);
    }

    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        for task_type in &order {
            if let Some(task) = groups.get_mut(task_type).and_then(|q| q.pop_front()) {
                out.push(task);
            }
        }
    }
    out
}
