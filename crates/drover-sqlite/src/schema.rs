//! Table layout and schema versioning for the SQLite store.

use drover_core::error::{Result, TaskManagerError};
use rusqlite::{Connection, OptionalExtension};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Create tables and indexes if they do not exist yet.
///
/// Refuses to open a database written by a newer schema.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            schema_version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            params TEXT NOT NULL,
            state TEXT NOT NULL,
            schedule TEXT,
            scheduled_at INTEGER NOT NULL,
            run_at INTEGER NOT NULL,
            retry_at INTEGER,
            started_at INTEGER,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            owner_id TEXT,
            priority INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            scope TEXT NOT NULL DEFAULT '[]',
            trace_id TEXT,
            version INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status_run_at
            ON tasks(status, run_at);

        CREATE INDEX IF NOT EXISTS idx_tasks_priority_run_at
            ON tasks(priority DESC, run_at, id);

        CREATE INDEX IF NOT EXISTS idx_tasks_retry_at
            ON tasks(retry_at) WHERE retry_at IS NOT NULL;
        "#,
    )
    .map_err(|e| TaskManagerError::Store(e.to_string()))?;

    conn.execute(
        "INSERT OR IGNORE INTO store_meta (id, schema_version) VALUES (0, ?1)",
        [SCHEMA_VERSION as i64],
    )
    .map_err(|e| TaskManagerError::Store(e.to_string()))?;

    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(TaskManagerError::Store(format!(
            "Database schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }
    Ok(())
}

/// Schema version recorded in the database, or 0 for a fresh file.
pub fn schema_version(conn: &Connection) -> Result<u32> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT schema_version FROM store_meta WHERE id = 0",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| TaskManagerError::Store(e.to_string()))?;

    Ok(version.unwrap_or(0) as u32)
}
