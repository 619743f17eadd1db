//! Task documents and their lifecycle states.

use crate::error::TaskManagerError;
use crate::schedule::Schedule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a stored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for `run_at` to elapse.
    Idle,
    /// Claimed by an owner, not yet started.
    Claiming,
    /// Handler is executing.
    Running,
    /// Terminal failure; only `run_now` brings it back.
    Failed,
    /// The task type has no registered definition.
    Unrecognized,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Claimed or running: some owner currently holds the task.
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Claiming | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "claiming" => Ok(Self::Claiming),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "unrecognized" => Ok(Self::Unrecognized),
            other => Err(TaskManagerError::Store(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

/// Weight a running task consumes from the pool's cost budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCost {
    Tiny,
    #[default]
    Normal,
    ExtraLarge,
}

impl TaskCost {
    pub fn units(&self) -> u32 {
        match self {
            Self::Tiny => 1,
            Self::Normal => 2,
            Self::ExtraLarge => 10,
        }
    }
}

/// Claim priority of a task type. Higher values are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    NormalLongRunning,
    #[default]
    Normal,
}

impl TaskPriority {
    pub fn value(&self) -> i32 {
        match self {
            Self::Low => 1,
            Self::NormalLongRunning => 40,
            Self::Normal => 50,
        }
    }
}

/// Opaque optimistic-concurrency token assigned by the store.
///
/// Every successful write yields a new version; a conditional write with a
/// stale version fails with [`TaskManagerError::VersionConflict`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Build a version from the store's native counter.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The store's native counter.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A task as submitted by a caller of the scheduling API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Key into the task type registry.
    pub task_type: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default = "empty_object")]
    pub state: Value,
    /// Recurrence; absent for one-shot tasks.
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// First run time; defaults to now.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Overrides the task type's priority.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl TaskInstance {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            params: empty_object(),
            state: empty_object(),
            schedule: None,
            run_at: None,
            scope: Vec::new(),
            trace_id: None,
            priority: None,
            enabled: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_scope(mut self, scope: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }
}

/// A task document as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcreteTaskInstance {
    pub id: String,
    pub task_type: String,
    pub params: Value,
    pub state: Value,
    pub schedule: Option<Schedule>,
    /// When the current run was scheduled to happen.
    pub scheduled_at: DateTime<Utc>,
    /// The task is due once `run_at <= now`.
    pub run_at: DateTime<Utc>,
    /// Claim expiry; a claimed or running task past this is reclaimable.
    pub retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// Consecutive failed executions since the last success.
    pub attempts: u32,
    pub owner_id: Option<String>,
    pub priority: i32,
    pub enabled: bool,
    pub scope: Vec<String>,
    pub trace_id: Option<String>,
    pub version: Version,
}

impl ConcreteTaskInstance {
    /// Whether the task is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }

    /// Whether an owner's claim on this task has lapsed.
    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_owned() && self.retry_at.map_or(true, |retry_at| retry_at < now)
    }

    /// Clear ownership fields and return the task to `idle`.
    pub fn release_to_idle(&mut self) {
        self.status = TaskStatus::Idle;
        self.owner_id = None;
        self.retry_at = None;
        self.started_at = None;
    }
}
