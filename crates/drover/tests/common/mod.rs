// Shared fixtures for the drover integration tests. Each test binary pulls
// in what it needs.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use drover::prelude::*;
use drover::Version;
use drover_sqlite::SqliteTaskStore;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn store() -> Arc<SqliteTaskStore> {
    Arc::new(SqliteTaskStore::open_in_memory().unwrap())
}

/// Config tuned for tests: small poll interval, short backoff.
pub fn test_config() -> TaskManagerConfig {
    TaskManagerConfig::new()
        .with_poll_interval(Duration::from_millis(10))
        .with_max_poll_interval(Duration::from_millis(200))
        .with_backoff(Duration::from_secs(1), Duration::from_secs(60))
}

/// A stored document that bypasses scheduling validation.
pub fn raw_task(id: &str, task_type: &str) -> ConcreteTaskInstance {
    let now = Utc::now() - ChronoDuration::seconds(1);
    ConcreteTaskInstance {
        id: id.into(),
        task_type: task_type.into(),
        params: json!({}),
        state: json!({}),
        schedule: None,
        scheduled_at: now,
        run_at: now,
        retry_at: None,
        started_at: None,
        status: TaskStatus::Idle,
        attempts: 0,
        owner_id: None,
        priority: TaskPriority::Normal.value(),
        enabled: true,
        scope: vec![],
        trace_id: None,
        version: Version::default(),
    }
}

/// Poll once and wait for every started run to finish.
pub async fn poll_and_drain(manager: &TaskManager) -> PollStats {
    let stats = manager.poll_once().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), manager.pool().wait_for_idle())
        .await
        .expect("runs did not finish");
    stats
}

/// Wait until `cond` holds, failing the test after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// `at` lies in `[lo, hi]`, allowing for the store's millisecond precision.
pub fn assert_between(at: DateTime<Utc>, lo: DateTime<Utc>, hi: DateTime<Utc>) {
    let lo = lo - ChronoDuration::milliseconds(1);
    assert!(at >= lo && at <= hi, "{} not in [{}, {}]", at, lo, hi);
}

/// Succeeds and counts its runs in the task state.
pub struct CountingHandler {
    pub task_type: &'static str,
    pub runs: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new(task_type: &'static str) -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Self {
                task_type,
                runs: runs.clone(),
            },
            runs,
        )
    }
}

#[async_trait]
impl TaskHandler for CountingHandler {
    fn task_type(&self) -> &str {
        self.task_type
    }

    async fn run(&self, ctx: &RunContext) -> std::result::Result<RunResult, TaskRunError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let runs = ctx.state()["runs"].as_u64().unwrap_or(0);
        Ok(RunResult::new().with_state(json!({ "runs": runs + 1 })))
    }

    fn validate(&self, params: &serde_json::Value) -> Result<()> {
        if params.get("invalid").is_some() {
            return Err(TaskManagerError::InvalidTask("invalid params".into()));
        }
        Ok(())
    }
}

/// Always fails.
pub struct FailingHandler {
    pub task_type: &'static str,
    pub unrecoverable: bool,
    pub retry_at: Option<DateTime<Utc>>,
}

impl FailingHandler {
    pub fn retryable(task_type: &'static str) -> Self {
        Self {
            task_type,
            unrecoverable: false,
            retry_at: None,
        }
    }

    pub fn unrecoverable(task_type: &'static str) -> Self {
        Self {
            task_type,
            unrecoverable: true,
            retry_at: None,
        }
    }
}

#[async_trait]
impl TaskHandler for FailingHandler {
    fn task_type(&self) -> &str {
        self.task_type
    }

    async fn run(&self, _ctx: &RunContext) -> std::result::Result<RunResult, TaskRunError> {
        if self.unrecoverable {
            return Err(TaskRunError::unrecoverable("bad input"));
        }
        match self.retry_at {
            Some(at) => Err(TaskRunError::retry_at("rate limited", at)),
            None => Err(anyhow::anyhow!("upstream unavailable").into()),
        }
    }
}

/// Blocks each run until the test adds permits to `gate`.
pub struct GatedHandler {
    pub task_type: &'static str,
    pub started: Arc<AtomicUsize>,
    pub gate: Arc<Semaphore>,
}

impl GatedHandler {
    pub fn new(task_type: &'static str) -> (Self, Arc<AtomicUsize>, Arc<Semaphore>) {
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                task_type,
                started: started.clone(),
                gate: gate.clone(),
            },
            started,
            gate,
        )
    }
}

#[async_trait]
impl TaskHandler for GatedHandler {
    fn task_type(&self) -> &str {
        self.task_type
    }

    async fn run(&self, _ctx: &RunContext) -> std::result::Result<RunResult, TaskRunError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        Ok(RunResult::new())
    }
}

/// Sleeps longer than any test timeout. The cooperative variant stops on
/// cancellation.
pub struct SlowHandler {
    pub task_type: &'static str,
    pub cooperative: bool,
    pub observed_cancel: Arc<AtomicBool>,
    pub cancel_hook: Arc<AtomicBool>,
    pub finished: Arc<AtomicBool>,
}

impl SlowHandler {
    pub fn new(task_type: &'static str, cooperative: bool) -> Self {
        Self {
            task_type,
            cooperative,
            observed_cancel: Arc::new(AtomicBool::new(false)),
            cancel_hook: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl TaskHandler for SlowHandler {
    fn task_type(&self) -> &str {
        self.task_type
    }

    async fn run(&self, ctx: &RunContext) -> std::result::Result<RunResult, TaskRunError> {
        if self.cooperative {
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.observed_cancel.store(true, Ordering::SeqCst);
                    return Err(TaskRunError::retryable("cancelled"));
                }
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        } else {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        self.finished.store(true, Ordering::SeqCst);
        Ok(RunResult::new())
    }

    async fn cancel(&self, _ctx: &RunContext) {
        self.cancel_hook.store(true, Ordering::SeqCst);
    }
}

/// Panics on every run.
pub struct PanickingHandler;

#[async_trait]
impl TaskHandler for PanickingHandler {
    fn task_type(&self) -> &str {
        "panics"
    }

    async fn run(&self, _ctx: &RunContext) -> std::result::Result<RunResult, TaskRunError> {
        panic!("handler bug");
    }
}

/// Ignores cancellation and has a `cancel` hook that never returns.
pub struct HangingCancelHandler;

#[async_trait]
impl TaskHandler for HangingCancelHandler {
    fn task_type(&self) -> &str {
        "hangs"
    }

    async fn run(&self, _ctx: &RunContext) -> std::result::Result<RunResult, TaskRunError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(RunResult::new())
    }

    async fn cancel(&self, _ctx: &RunContext) {
        std::future::pending::<()>().await;
    }
}
