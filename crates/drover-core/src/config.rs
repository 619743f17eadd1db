//! Task manager configuration.

use crate::error::{Result, TaskManagerError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tie-break among due tasks during a claim cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOrdering {
    /// Highest task priority first, then the oldest `run_at`.
    #[default]
    Priority,
    /// Oldest `run_at` first, interleaved across task types.
    RoundRobin,
}

/// Configuration for a task manager instance.
///
/// All fields are read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagerConfig {
    /// Base delay between claim cycles.
    /// Default: 3000
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound for the adaptive poll delay after failed cycles.
    /// Default: 60000
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    /// Pool budget in cost units.
    /// Default: 20 (ten normal tasks)
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// How long a claim stays valid before other owners may take the task.
    /// Default: 30000
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,

    /// Documents fetched per claim query page.
    #[serde(default = "default_claim_page_size")]
    pub claim_page_size: usize,

    /// Pages searched per claim cycle.
    #[serde(default = "default_claim_max_pages")]
    pub claim_max_pages: usize,

    #[serde(default)]
    pub claim_ordering: ClaimOrdering,

    /// Attempts before a failing task turns terminal, unless its type overrides it.
    /// Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retry delay is `backoff_base * 2^attempts`, capped at `backoff_cap`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Handler timeout for task types that do not declare one.
    /// Default: 300000 (5 minutes)
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Runs that start within this delay of `run_at` compute the next
    /// interval from `run_at`. Zero disables it.
    #[serde(default)]
    pub precise_scheduling_threshold_ms: u64,

    /// Task types this instance never claims (`*` wildcards allowed).
    #[serde(default)]
    pub exclude_task_types: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_max_poll_interval_ms() -> u64 {
    60_000
}

fn default_capacity() -> u32 {
    20
}

fn default_claim_timeout_ms() -> u64 {
    30_000
}

fn default_claim_page_size() -> usize {
    100
}

fn default_claim_max_pages() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    60_000
}

fn default_backoff_cap_ms() -> u64 {
    3_600_000
}

fn default_timeout_ms() -> u64 {
    300_000
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            capacity: default_capacity(),
            claim_timeout_ms: default_claim_timeout_ms(),
            claim_page_size: default_claim_page_size(),
            claim_max_pages: default_claim_max_pages(),
            claim_ordering: ClaimOrdering::default(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            default_timeout_ms: default_timeout_ms(),
            precise_scheduling_threshold_ms: 0,
            exclude_task_types: Vec::new(),
        }
    }
}

impl TaskManagerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_claim_page_size(mut self, size: usize) -> Self {
        self.claim_page_size = size;
        self
    }

    pub fn with_claim_max_pages(mut self, pages: usize) -> Self {
        self.claim_max_pages = pages;
        self
    }

    pub fn with_claim_ordering(mut self, ordering: ClaimOrdering) -> Self {
        self.claim_ordering = ordering;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the retry backoff base delay and cap.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_cap_ms = cap.as_millis() as u64;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_precise_scheduling_threshold(mut self, threshold: Duration) -> Self {
        self.precise_scheduling_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn with_exclude_task_types(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.exclude_task_types = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn precise_scheduling_threshold(&self) -> Duration {
        Duration::from_millis(self.precise_scheduling_threshold_ms)
    }

    /// Retry delay after `attempts` consecutive failures.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_cap_ms))
    }

    /// Reject configurations the poll loop cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TaskManagerError::InvalidConfig(msg.to_string()));
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be greater than zero");
        }
        if self.max_poll_interval_ms < self.poll_interval_ms {
            return invalid("max_poll_interval_ms must be at least poll_interval_ms");
        }
        if self.capacity == 0 {
            return invalid("capacity must be greater than zero");
        }
        if self.claim_timeout_ms == 0 {
            return invalid("claim_timeout_ms must be greater than zero");
        }
        if self.claim_page_size == 0 || self.claim_max_pages == 0 {
            return invalid("claim_page_size and claim_max_pages must be greater than zero");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be greater than zero");
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return invalid("backoff_cap_ms must be at least backoff_base_ms");
        }
        if self.default_timeout_ms == 0 {
            return invalid("default_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

/// Configuration for the SQLite task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,

    /// Enable WAL mode
    /// Default: true
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,

    /// How long a writer waits on a locked database.
    /// Default: 5000
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_wal_mode() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl SqliteStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            wal_mode: default_wal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    pub fn with_wal_mode(mut self, wal_mode: bool) -> Self {
        self.wal_mode = wal_mode;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
