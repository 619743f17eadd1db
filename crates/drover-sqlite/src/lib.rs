//! SQLite-backed task store
//!
//! Stores task documents in a single table with an integer `version`
//! column. Every write increments the version; conditional writes compare
//! it in the `WHERE` clause, so a stale writer changes nothing.
//!
//! Key features:
//! - Optimistic concurrency on a per-document version token
//! - Paged search with `search_after` cursors
//! - WAL mode for concurrent readers across processes

pub mod schema;
pub mod store;

pub use store::SqliteTaskStore;
