//! Document store abstraction used as the shared work queue.
//!
//! The store is the only coordination point between scheduler processes.
//! Every document carries a [`Version`]; [`TaskStore::update`] applies only
//! when the caller's version still matches, otherwise it fails with
//! [`TaskManagerError::VersionConflict`](crate::TaskManagerError::VersionConflict).

use crate::error::Result;
use crate::task::{ConcreteTaskInstance, TaskStatus, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One conjunction of filters. Empty fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskClause {
    pub statuses: Vec<TaskStatus>,
    pub task_types: Vec<String>,
    pub run_at_lte: Option<DateTime<Utc>>,
    pub retry_at_lt: Option<DateTime<Utc>>,
    pub attempts_lt: Option<u32>,
}

impl TaskClause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_types.push(task_type.into());
        self
    }

    pub fn run_at_lte(mut self, at: DateTime<Utc>) -> Self {
        self.run_at_lte = Some(at);
        self
    }

    pub fn retry_at_lt(mut self, at: DateTime<Utc>) -> Self {
        self.retry_at_lt = Some(at);
        self
    }

    pub fn attempts_lt(mut self, attempts: u32) -> Self {
        self.attempts_lt = Some(attempts);
        self
    }

    /// Evaluate the clause against a document.
    pub fn matches(&self, task: &ConcreteTaskInstance) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && (self.task_types.is_empty() || self.task_types.contains(&task.task_type))
            && self.run_at_lte.map_or(true, |at| task.run_at <= at)
            && self
                .retry_at_lt
                .map_or(true, |at| task.retry_at.map_or(false, |retry| retry < at))
            && self.attempts_lt.map_or(true, |n| task.attempts < n)
    }
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskSort {
    /// Priority descending, then `run_at` ascending, then id.
    #[default]
    PriorityThenRunAt,
    /// `run_at` ascending, then id.
    RunAt,
}

/// Position after the last document of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchAfter {
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub id: String,
}

impl SearchAfter {
    pub fn from_task(task: &ConcreteTaskInstance) -> Self {
        Self {
            priority: task.priority,
            run_at: task.run_at,
            id: task.id.clone(),
        }
    }
}

/// A paged search over task documents.
///
/// Clauses are OR-ed together; a query without clauses matches every document.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskQuery {
    pub clauses: Vec<TaskClause>,
    /// Task type patterns to leave out. `*` matches any run of characters.
    pub exclude_task_types: Vec<String>,
    pub enabled_only: bool,
    pub sort: TaskSort,
    pub size: usize,
    pub search_after: Option<SearchAfter>,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            clauses: Vec::new(),
            exclude_task_types: Vec::new(),
            enabled_only: false,
            sort: TaskSort::default(),
            size: 100,
            search_after: None,
        }
    }
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn or(mut self, clause: TaskClause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn enabled_only(mut self) -> Self {
        self.enabled_only = true;
        self
    }

    pub fn excluding(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude_task_types = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn sorted_by(mut self, sort: TaskSort) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn after(mut self, cursor: Option<SearchAfter>) -> Self {
        self.search_after = cursor;
        self
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct TaskPage {
    pub tasks: Vec<ConcreteTaskInstance>,
    /// Cursor for the following page; `None` when this page was the last.
    pub next: Option<SearchAfter>,
}

/// Match a task type against an exclusion pattern (`*` wildcard).
pub fn task_type_matches(pattern: &str, task_type: &str) -> bool {
    let Some((head, rest)) = pattern.split_once('*') else {
        return pattern == task_type;
    };
    let Some(mut remaining) = task_type.strip_prefix(head) else {
        return false;
    };
    let mut pieces: Vec<&str> = rest.split('*').collect();
    let tail = pieces.pop().unwrap_or_default();
    for piece in pieces {
        match remaining.find(piece) {
            Some(idx) => remaining = &remaining[idx + piece.len()..],
            None => return false,
        }
    }
    remaining.len() >= tail.len() && remaining.ends_with(tail)
}

/// Persistent storage for task documents.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new document. Fails with `TaskAlreadyExists` on id collision.
    async fn create(&self, task: ConcreteTaskInstance) -> Result<ConcreteTaskInstance>;

    /// Fetch one document. Fails with `TaskNotFound`.
    async fn get(&self, id: &str) -> Result<ConcreteTaskInstance>;

    /// Fetch many documents; results follow the order of `ids`.
    async fn bulk_get(
        &self,
        ids: &[String],
    ) -> Result<Vec<(String, Result<ConcreteTaskInstance>)>>;

    /// Write `task` if the stored version still equals `task.version`.
    async fn update(&self, task: &ConcreteTaskInstance) -> Result<ConcreteTaskInstance>;

    /// Conditional update of many documents with per-document results.
    async fn bulk_update(
        &self,
        tasks: &[ConcreteTaskInstance],
    ) -> Result<Vec<(String, Result<ConcreteTaskInstance>)>>;

    /// Delete a document, optionally only if it is still at `expected_version`.
    async fn remove(&self, id: &str, expected_version: Option<&Version>) -> Result<()>;

    /// Run a paged search.
    async fn query(&self, query: &TaskQuery) -> Result<TaskPage>;

    /// Number of documents per status.
    async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>>;
}
