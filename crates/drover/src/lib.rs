//! Drover
//!
//! A polling task manager for persisted tasks.
//!
//! # Overview
//!
//! Drover runs tasks stored in a shared [`TaskStore`]:
//! - One-shot tasks at a given time, or right away
//! - Recurring tasks on an interval, recurrence rule or cron expression
//! - Cost-weighted capacity with per-type concurrency limits
//! - Timeouts with cooperative cancellation
//! - Automatic retries with exponential backoff
//! - Ephemeral runs that never touch the store
//!
//! # Architecture
//!
//! 1. **Claiming**: each poll selects due tasks and marks them owned with a
//!    conditional update; a lost race is skipped, never retried
//! 2. **Pool**: claimed tasks run only while their cost fits the budget
//! 3. **Runner**: executes the handler and writes the next state back
//! 4. **Scheduling**: the public API for creating and changing tasks
//!
//! Processes never talk to each other. Any number of managers with distinct
//! owner ids can share a store.
//!
//! # Example
//!
//! ```ignore
//! use drover::prelude::*;
//! use drover_sqlite::SqliteTaskStore;
//!
//! struct ReportHandler;
//!
//! #[async_trait]
//! impl TaskHandler for ReportHandler {
//!     fn task_type(&self) -> &str {
//!         "generate_report"
//!     }
//!
//!     async fn run(&self, ctx: &RunContext) -> std::result::Result<RunResult, TaskRunError> {
//!         let runs = ctx.state()["runs"].as_u64().unwrap_or(0);
//!         Ok(RunResult::new().with_state(serde_json::json!({ "runs": runs + 1 })))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store = Arc::new(SqliteTaskStore::open(SqliteStoreConfig::new("./tasks.db"))?);
//!
//!     let manager = TaskManager::builder(store)
//!         .with_task(
//!             TaskDefinition::new("generate_report").with_cost(TaskCost::Tiny),
//!             ReportHandler,
//!         )
//!         .build()?;
//!
//!     manager
//!         .scheduling()
//!         .ensure_scheduled(
//!             TaskInstance::new("generate_report")
//!                 .with_id("daily-report")
//!                 .with_schedule(Schedule::interval("1d")),
//!         )
//!         .await?;
//!
//!     manager.run().await
//! }
//! ```

pub mod claim;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod runner;
pub mod scheduling;

pub mod prelude;

// Re-export core types
pub use drover_core::{
    ClaimOrdering, ConcreteTaskInstance, Frequency, RecurrenceRule, Result, Schedule,
    SearchAfter, SqliteStoreConfig, TaskClause, TaskCost, TaskInstance, TaskManagerConfig,
    TaskManagerError, TaskPage, TaskPriority, TaskQuery, TaskSort, TaskStatus, TaskStore,
    Version,
};

// Re-export main types from this crate
pub use claim::{interleave_by_type, ClaimResult, ClaimStats, TaskClaimer};
pub use manager::{PollStats, TaskManager, TaskManagerBuilder};
pub use pool::{PoolPermit, PoolRejection, TaskPool};
pub use registry::{
    RegisteredTask, RunContext, RunResult, TaskDefinition, TaskHandler, TaskRunError,
    TaskTypeRegistry,
};
pub use runner::{TaskRunOutcome, TaskRunner};
pub use scheduling::{BulkResult, EphemeralRunResult, EphemeralTask, TaskScheduling};
