//! SQLite implementation of the task store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_core::{
    error::{Result, TaskManagerError},
    store::{SearchAfter, TaskClause, TaskPage, TaskQuery, TaskSort, TaskStore},
    task::{ConcreteTaskInstance, TaskStatus, Version},
    SqliteStoreConfig,
};
use parking_lot::Mutex;
use rusqlite::{
    params, types::Value as SqlValue, Connection, ErrorCode, OpenFlags, OptionalExtension, Row,
};
use std::sync::Arc;
use std::time::Duration;

use crate::schema;

const COLUMNS: &str = "id, task_type, params, state, schedule, scheduled_at, run_at, retry_at, \
                       started_at, status, attempts, owner_id, priority, enabled, scope, \
                       trace_id, version";

/// SQLite-backed task store
///
/// A single connection guarded by a mutex. Share one instance between
/// managers in the same process with `Arc`; separate processes open the
/// same file.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open (or create) the database described by `cfg`.
    pub fn open(cfg: SqliteStoreConfig) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = cfg.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TaskManagerError::Store(e.to_string()))?;
            }
        }

        let conn = Connection::open_with_flags(
            &cfg.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(store_err)?;

        Self::configure_connection(&conn, &cfg)?;
        schema::init_schema(&conn)?;

        tracing::debug!(path = %cfg.path.display(), wal = cfg.wal_mode, "Opened task store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection, cfg: &SqliteStoreConfig) -> Result<()> {
        conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))
            .map_err(|e| TaskManagerError::InvalidConfig(e.to_string()))?;

        if cfg.wal_mode {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| TaskManagerError::InvalidConfig(e.to_string()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(|e| TaskManagerError::InvalidConfig(e.to_string()))?;
        }
        Ok(())
    }
}

fn store_err(e: rusqlite::Error) -> TaskManagerError {
    TaskManagerError::Store(e.to_string())
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TaskManagerError::Store(format!("invalid timestamp {}", ms)))
}

/// Raw column values, decoded outside the rusqlite row callback.
struct TaskRow {
    id: String,
    task_type: String,
    params: String,
    state: String,
    schedule: Option<String>,
    scheduled_at: i64,
    run_at: i64,
    retry_at: Option<i64>,
    started_at: Option<i64>,
    status: String,
    attempts: i64,
    owner_id: Option<String>,
    priority: i64,
    enabled: bool,
    scope: String,
    trace_id: Option<String>,
    version: i64,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            params: row.get(2)?,
            state: row.get(3)?,
            schedule: row.get(4)?,
            scheduled_at: row.get(5)?,
            run_at: row.get(6)?,
            retry_at: row.get(7)?,
            started_at: row.get(8)?,
            status: row.get(9)?,
            attempts: row.get(10)?,
            owner_id: row.get(11)?,
            priority: row.get(12)?,
            enabled: row.get(13)?,
            scope: row.get(14)?,
            trace_id: row.get(15)?,
            version: row.get(16)?,
        })
    }

    fn into_task(self) -> Result<ConcreteTaskInstance> {
        Ok(ConcreteTaskInstance {
            id: self.id,
            task_type: self.task_type,
            params: serde_json::from_str(&self.params)?,
            state: serde_json::from_str(&self.state)?,
            schedule: self
                .schedule
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            scheduled_at: from_millis(self.scheduled_at)?,
            run_at: from_millis(self.run_at)?,
            retry_at: self.retry_at.map(from_millis).transpose()?,
            started_at: self.started_at.map(from_millis).transpose()?,
            status: self.status.parse()?,
            attempts: self.attempts.max(0) as u32,
            owner_id: self.owner_id,
            priority: self.priority as i32,
            enabled: self.enabled,
            scope: serde_json::from_str(&self.scope)?,
            trace_id: self.trace_id,
            version: Version::from_raw(self.version as u64),
        })
    }
}

/// JSON-encoded document columns.
struct Encoded {
    params: String,
    state: String,
    schedule: Option<String>,
    scope: String,
}

impl Encoded {
    fn new(task: &ConcreteTaskInstance) -> Result<Self> {
        Ok(Self {
            params: serde_json::to_string(&task.params)?,
            state: serde_json::to_string(&task.state)?,
            schedule: task
                .schedule
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            scope: serde_json::to_string(&task.scope)?,
        })
    }
}

fn fetch_task(conn: &Connection, id: &str) -> Result<ConcreteTaskInstance> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS);
    let row = conn
        .query_row(&sql, params![id], TaskRow::from_row)
        .optional()
        .map_err(store_err)?;

    row.ok_or_else(|| TaskManagerError::TaskNotFound(id.to_string()))?
        .into_task()
}

/// Explain why a conditional write touched no rows.
fn missing_or_conflict(conn: &Connection, id: &str) -> TaskManagerError {
    let current: std::result::Result<Option<i64>, _> = conn
        .query_row("SELECT version FROM tasks WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional();

    match current {
        Ok(Some(_)) => TaskManagerError::VersionConflict { id: id.to_string() },
        Ok(None) => TaskManagerError::TaskNotFound(id.to_string()),
        Err(e) => store_err(e),
    }
}

fn insert_task(conn: &Connection, task: &ConcreteTaskInstance) -> Result<()> {
    let encoded = Encoded::new(task)?;
    let sql = format!(
        "INSERT INTO tasks ({}) VALUES \
         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 1)",
        COLUMNS
    );
    let result = conn.execute(
        &sql,
        params![
            task.id,
            task.task_type,
            encoded.params,
            encoded.state,
            encoded.schedule,
            task.scheduled_at.timestamp_millis(),
            task.run_at.timestamp_millis(),
            task.retry_at.map(|t| t.timestamp_millis()),
            task.started_at.map(|t| t.timestamp_millis()),
            task.status.as_str(),
            task.attempts as i64,
            task.owner_id,
            task.priority as i64,
            task.enabled,
            encoded.scope,
            task.trace_id,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            Err(TaskManagerError::TaskAlreadyExists(task.id.clone()))
        }
        Err(e) => Err(store_err(e)),
    }
}

fn update_task(conn: &Connection, task: &ConcreteTaskInstance) -> Result<ConcreteTaskInstance> {
    let encoded = Encoded::new(task)?;
    let changed = conn
        .execute(
            "UPDATE tasks SET task_type = ?3, params = ?4, state = ?5, schedule = ?6, \
             scheduled_at = ?7, run_at = ?8, retry_at = ?9, started_at = ?10, status = ?11, \
             attempts = ?12, owner_id = ?13, priority = ?14, enabled = ?15, scope = ?16, \
             trace_id = ?17, version = version + 1 \
             WHERE id = ?1 AND version = ?2",
            params![
                task.id,
                task.version.raw() as i64,
                task.task_type,
                encoded.params,
                encoded.state,
                encoded.schedule,
                task.scheduled_at.timestamp_millis(),
                task.run_at.timestamp_millis(),
                task.retry_at.map(|t| t.timestamp_millis()),
                task.started_at.map(|t| t.timestamp_millis()),
                task.status.as_str(),
                task.attempts as i64,
                task.owner_id,
                task.priority as i64,
                task.enabled,
                encoded.scope,
                task.trace_id,
            ],
        )
        .map_err(store_err)?;

    if changed == 0 {
        return Err(missing_or_conflict(conn, &task.id));
    }
    fetch_task(conn, &task.id)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Escape SQLite GLOB metacharacters other than `*`.
fn glob_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '?' => out.push_str("[?]"),
            '[' => out.push_str("[[]"),
            _ => out.push(c),
        }
    }
    out
}

fn clause_sql(clause: &TaskClause, args: &mut Vec<SqlValue>) -> String {
    let mut conds = Vec::new();

    if !clause.statuses.is_empty() {
        conds.push(format!("status IN ({})", placeholders(clause.statuses.len())));
        args.extend(
            clause
                .statuses
                .iter()
                .map(|s| SqlValue::Text(s.as_str().to_string())),
        );
    }
    if !clause.task_types.is_empty() {
        conds.push(format!(
            "task_type IN ({})",
            placeholders(clause.task_types.len())
        ));
        args.extend(clause.task_types.iter().cloned().map(SqlValue::Text));
    }
    if let Some(at) = clause.run_at_lte {
        conds.push("run_at <= ?".to_string());
        args.push(SqlValue::Integer(at.timestamp_millis()));
    }
    if let Some(at) = clause.retry_at_lt {
        conds.push("(retry_at IS NOT NULL AND retry_at < ?)".to_string());
        args.push(SqlValue::Integer(at.timestamp_millis()));
    }
    if let Some(n) = clause.attempts_lt {
        conds.push("attempts < ?".to_string());
        args.push(SqlValue::Integer(n as i64));
    }

    if conds.is_empty() {
        "1=1".to_string()
    } else {
        format!("({})", conds.join(" AND "))
    }
}

/// Translate a query into SQL with positional arguments.
fn build_query(query: &TaskQuery) -> (String, Vec<SqlValue>) {
    let mut sql = format!("SELECT {} FROM tasks WHERE 1=1", COLUMNS);
    let mut args = Vec::new();

    if !query.clauses.is_empty() {
        let parts: Vec<String> = query
            .clauses
            .iter()
            .map(|clause| clause_sql(clause, &mut args))
            .collect();
        sql.push_str(&format!(" AND ({})", parts.join(" OR ")));
    }

    if query.enabled_only {
        sql.push_str(" AND enabled = 1");
    }

    for pattern in &query.exclude_task_types {
        sql.push_str(" AND task_type NOT GLOB ?");
        args.push(SqlValue::Text(glob_pattern(pattern)));
    }

    if let Some(cursor) = &query.search_after {
        let run_at = cursor.run_at.timestamp_millis();
        match query.sort {
            TaskSort::PriorityThenRunAt => {
                sql.push_str(
                    " AND (priority < ? OR (priority = ? AND \
                     (run_at > ? OR (run_at = ? AND id > ?))))",
                );
                args.push(SqlValue::Integer(cursor.priority as i64));
                args.push(SqlValue::Integer(cursor.priority as i64));
                args.push(SqlValue::Integer(run_at));
                args.push(SqlValue::Integer(run_at));
                args.push(SqlValue::Text(cursor.id.clone()));
            }
            TaskSort::RunAt => {
                sql.push_str(" AND (run_at > ? OR (run_at = ? AND id > ?))");
                args.push(SqlValue::Integer(run_at));
                args.push(SqlValue::Integer(run_at));
                args.push(SqlValue::Text(cursor.id.clone()));
            }
        }
    }

    sql.push_str(match query.sort {
        TaskSort::PriorityThenRunAt => " ORDER BY priority DESC, run_at ASC, id ASC",
        TaskSort::RunAt => " ORDER BY run_at ASC, id ASC",
    });

    // One extra row tells whether another page exists.
    sql.push_str(" LIMIT ?");
    args.push(SqlValue::Integer(query.size as i64 + 1));

    (sql, args)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: ConcreteTaskInstance) -> Result<ConcreteTaskInstance> {
        let conn = self.conn.lock();
        insert_task(&conn, &task)?;
        fetch_task(&conn, &task.id)
    }

    async fn get(&self, id: &str) -> Result<ConcreteTaskInstance> {
        let conn = self.conn.lock();
        fetch_task(&conn, id)
    }

    async fn bulk_get(
        &self,
        ids: &[String],
    ) -> Result<Vec<(String, Result<ConcreteTaskInstance>)>> {
        let conn = self.conn.lock();
        Ok(ids
            .iter()
            .map(|id| (id.clone(), fetch_task(&conn, id)))
            .collect())
    }

    async fn update(&self, task: &ConcreteTaskInstance) -> Result<ConcreteTaskInstance> {
        let conn = self.conn.lock();
        update_task(&conn, task)
    }

    async fn bulk_update(
        &self,
        tasks: &[ConcreteTaskInstance],
    ) -> Result<Vec<(String, Result<ConcreteTaskInstance>)>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;
        let results = tasks
            .iter()
            .map(|task| (task.id.clone(), update_task(&tx, task)))
            .collect();
        tx.commit().map_err(store_err)?;
        Ok(results)
    }

    async fn remove(&self, id: &str, expected_version: Option<&Version>) -> Result<()> {
        let conn = self.conn.lock();
        let changed = match expected_version {
            Some(version) => conn.execute(
                "DELETE FROM tasks WHERE id = ?1 AND version = ?2",
                params![id, version.raw() as i64],
            ),
            None => conn.execute("DELETE FROM tasks WHERE id = ?1", params![id]),
        }
        .map_err(store_err)?;

        if changed == 0 {
            return Err(missing_or_conflict(&conn, id));
        }
        Ok(())
    }

    async fn query(&self, query: &TaskQuery) -> Result<TaskPage> {
        let (sql, args) = build_query(query);
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&sql).map_err(store_err)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), TaskRow::from_row)
                .map_err(store_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(store_err)?;
            rows
        };

        let mut tasks = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>>>()?;

        let has_more = tasks.len() > query.size;
        tasks.truncate(query.size);
        let next = if has_more {
            tasks.last().map(SearchAfter::from_task)
        } else {
            None
        };

        Ok(TaskPage { tasks, next })
    }

    async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        rows.into_iter()
            .map(|(status, count)| Ok((status.parse()?, count as u64)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use drover_core::{Schedule, TaskPriority};
    use serde_json::json;
    use tempfile::TempDir;

    fn new_task(id: &str, task_type: &str) -> ConcreteTaskInstance {
        let now = Utc::now();
        ConcreteTaskInstance {
            id: id.to_string(),
            task_type: task_type.to_string(),
            params: json!({ "n": 1 }),
            state: json!({}),
            schedule: Some(Schedule::interval("5m")),
            scheduled_at: now,
            run_at: now - ChronoDuration::seconds(1),
            retry_at: None,
            started_at: None,
            status: TaskStatus::Idle,
            attempts: 0,
            owner_id: None,
            priority: TaskPriority::Normal.value(),
            enabled: true,
            scope: vec!["alerting".to_string()],
            trace_id: None,
            version: Version::default(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let created = store.create(new_task("t1", "report")).await.unwrap();
        assert_eq!(created.version, Version::from_raw(1));

        let fetched = store.get("t1").await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.schedule, Some(Schedule::interval("5m")));
        assert_eq!(fetched.scope, vec!["alerting".to_string()]);

        assert!(matches!(
            store.create(new_task("t1", "report")).await,
            Err(TaskManagerError::TaskAlreadyExists(_))
        ));
        assert!(store.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let original = store.create(new_task("t1", "report")).await.unwrap();

        let mut first = original.clone();
        first.status = TaskStatus::Claiming;
        first.owner_id = Some("a".into());
        let updated = store.update(&first).await.unwrap();
        assert_eq!(updated.version, Version::from_raw(2));

        // A second writer holding the old version loses.
        let mut second = original.clone();
        second.owner_id = Some("b".into());
        let err = store.update(&second).await.unwrap_err();
        assert!(err.is_version_conflict());

        let stored = store.get("t1").await.unwrap();
        assert_eq!(stored.owner_id.as_deref(), Some("a"));

        second.id = "gone".into();
        assert!(store.update(&second).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_bulk_update_reports_per_document() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let a = store.create(new_task("a", "report")).await.unwrap();
        let b = store.create(new_task("b", "report")).await.unwrap();

        let mut stale_b = b.clone();
        stale_b.version = Version::from_raw(7);
        let results = store.bulk_update(&[a.clone(), stale_b]).await.unwrap();

        assert!(results[0].1.is_ok());
        assert!(results[1].1.as_ref().unwrap_err().is_version_conflict());
    }

    #[tokio::test]
    async fn test_remove_with_expected_version() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = store.create(new_task("t1", "report")).await.unwrap();

        let err = store
            .remove("t1", Some(&Version::from_raw(99)))
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        store.remove("t1", Some(&task.version)).await.unwrap();
        assert!(store.remove("t1", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_query_pages_with_search_after() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .create(new_task(&format!("t{}", i), "report"))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .query(&TaskQuery::new().with_size(2).after(cursor))
                .await
                .unwrap();
            seen.extend(page.tasks.iter().map(|t| t.id.clone()));
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["t0", "t1", "t2", "t3", "t4"]);
    }

    #[tokio::test]
    async fn test_query_clauses_and_ordering() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let now = Utc::now();

        let mut low = new_task("low", "report");
        low.priority = TaskPriority::Low.value();
        store.create(low).await.unwrap();

        store.create(new_task("normal", "report")).await.unwrap();

        let mut future = new_task("future", "report");
        future.run_at = now + ChronoDuration::hours(1);
        store.create(future).await.unwrap();

        let mut disabled = new_task("disabled", "report");
        disabled.enabled = false;
        store.create(disabled).await.unwrap();

        let mut stale = new_task("stale", "report");
        stale.status = TaskStatus::Running;
        stale.retry_at = Some(now - ChronoDuration::seconds(10));
        store.create(stale).await.unwrap();

        let query = TaskQuery::new()
            .or(TaskClause::new()
                .with_statuses([TaskStatus::Idle])
                .run_at_lte(now))
            .or(TaskClause::new()
                .with_statuses([TaskStatus::Claiming, TaskStatus::Running])
                .retry_at_lt(now))
            .enabled_only();

        let page = store.query(&query).await.unwrap();
        let ids: Vec<_> = page.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids.last(), Some(&"low"));
        assert!(ids.contains(&"stale"));
        assert!(!ids.contains(&"future"));
        assert!(!ids.contains(&"disabled"));
    }

    #[tokio::test]
    async fn test_query_excludes_task_type_patterns() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.create(new_task("a", "actions:email")).await.unwrap();
        store.create(new_task("b", "actions:slack")).await.unwrap();
        store.create(new_task("c", "report")).await.unwrap();

        let page = store
            .query(&TaskQuery::new().excluding(["actions:*"]))
            .await
            .unwrap();
        let ids: Vec<_> = page.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.create(new_task("a", "report")).await.unwrap();
        store.create(new_task("b", "report")).await.unwrap();
        let mut failed = new_task("c", "report");
        failed.status = TaskStatus::Failed;
        store.create(failed).await.unwrap();

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(
            counts,
            vec![(TaskStatus::Failed, 1), (TaskStatus::Idle, 2)]
        );
    }

    #[tokio::test]
    async fn test_reopen_file_store() {
        let dir = TempDir::new().unwrap();
        let cfg = SqliteStoreConfig::new(dir.path().join("nested").join("tasks.db"));
        {
            let store = SqliteTaskStore::open(cfg.clone()).unwrap();
            store.create(new_task("t1", "report")).await.unwrap();
        }
        let store = SqliteTaskStore::open(cfg).unwrap();
        assert_eq!(store.get("t1").await.unwrap().task_type, "report");
    }
}
