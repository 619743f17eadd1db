//! Drover Core: task documents, schedules and the store contract
//!
//! This crate defines the pieces shared by every drover process:
//! - Task documents with lifecycle status, cost and priority
//! - Schedules: fixed intervals, recurrence rules and cron expressions
//! - The `TaskStore` trait: conditional updates on a version token plus paged search
//! - Error taxonomy and configuration
//!
//! Processes coordinate only through the store. A claim is a conditional
//! update; losing it means another owner got there first.

pub mod config;
pub mod error;
pub mod intervals;
pub mod observe;
pub mod rrule;
pub mod schedule;
pub mod store;
pub mod task;

pub use config::{ClaimOrdering, SqliteStoreConfig, TaskManagerConfig};
pub use error::{Result, TaskManagerError};
pub use rrule::{Frequency, RecurrenceRule};
pub use schedule::Schedule;
pub use store::{SearchAfter, TaskClause, TaskPage, TaskQuery, TaskSort, TaskStore};
pub use task::{
    ConcreteTaskInstance, TaskCost, TaskInstance, TaskPriority, TaskStatus, Version,
};
