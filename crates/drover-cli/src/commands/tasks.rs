//! Commands that modify task documents
//!
//! These edit the store directly. Running managers notice the changes on
//! their next poll.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use drover::prelude::*;
use drover_sqlite::SqliteTaskStore;

pub async fn run_now(store: &SqliteTaskStore, ids: &[String]) -> Result<()> {
    let mut failed = 0;
    for id in ids {
        match run_now_one(store, id).await {
            Ok(task) => println!("✓ {} due at {}", id, task.run_at.to_rfc3339()),
            Err(e) => {
                println!("✗ {}: {:#}", id, e);
                failed += 1;
            }
        }
    }
    finish(failed, ids.len())
}

/// Same rules as a manager's run request, minus the handler lookup: a
/// claimed or running task is refused even when its claim has expired, a
/// disabled task is refused, and a failed task starts over.
async fn run_now_one(store: &SqliteTaskStore, id: &str) -> Result<ConcreteTaskInstance> {
    let now = Utc::now();
    let mut task = store.get(id).await.context("Failed to load task")?;
    if !task.enabled {
        bail!("task is disabled");
    }
    if task.status.is_owned() {
        bail!(
            "task is {} by {}",
            task.status,
            task.owner_id.as_deref().unwrap_or("unknown owner")
        );
    }

    if task.status != TaskStatus::Idle {
        task.attempts = 0;
    }
    task.release_to_idle();
    task.run_at = now;
    store.update(&task).await.context("Failed to update task")
}

pub async fn set_enabled(
    store: &SqliteTaskStore,
    ids: &[String],
    enabled: bool,
    run_soon: bool,
) -> Result<()> {
    let now = Utc::now();
    let mut batch = Vec::new();
    let mut failed = 0;

    for (id, fetched) in store.bulk_get(ids).await.context("Failed to load tasks")? {
        match fetched {
            Ok(mut task) => {
                task.enabled = enabled;
                if run_soon && !task.status.is_owned() {
                    task.run_at = now;
                }
                batch.push(task);
            }
            Err(e) => {
                println!("✗ {}: {}", id, e);
                failed += 1;
            }
        }
    }

    let verb = if enabled { "enabled" } else { "disabled" };
    let results = store
        .bulk_update(&batch)
        .await
        .context("Failed to update tasks")?;
    for (id, result) in results {
        match result {
            Ok(_) => println!("✓ {} {}", id, verb),
            Err(e) => {
                println!("✗ {}: {}", id, e);
                failed += 1;
            }
        }
    }
    finish(failed, ids.len())
}

pub async fn remove(store: &SqliteTaskStore, ids: &[String], force: bool) -> Result<()> {
    let now = Utc::now();
    let mut failed = 0;

    for id in ids {
        let result = async {
            let task = store.get(id).await.context("Failed to load task")?;
            if !force && task.status.is_owned() && !task.claim_expired(now) {
                bail!("task is {}; pass --force to remove it anyway", task.status);
            }
            store
                .remove(id, Some(&task.version))
                .await
                .context("Failed to remove task")
        }
        .await;

        match result {
            Ok(()) => println!("✓ {} removed", id),
            Err(e) => {
                println!("✗ {}: {:#}", id, e);
                failed += 1;
            }
        }
    }
    finish(failed, ids.len())
}

fn finish(failed: usize, total: usize) -> Result<()> {
    if failed > 0 {
        bail!("{} of {} task(s) could not be changed", failed, total);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover::Version;
    use serde_json::json;

    fn task(id: &str) -> ConcreteTaskInstance {
        let now = Utc::now();
        ConcreteTaskInstance {
            id: id.into(),
            task_type: "report".into(),
            params: json!({}),
            state: json!({}),
            schedule: None,
            scheduled_at: now,
            run_at: now + chrono::Duration::hours(1),
            retry_at: None,
            started_at: None,
            status: TaskStatus::Idle,
            attempts: 0,
            owner_id: None,
            priority: 50,
            enabled: true,
            scope: vec![],
            trace_id: None,
            version: Version::default(),
        }
    }

    #[tokio::test]
    async fn test_run_now_resets_failed_task() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut failed = task("f1");
        failed.status = TaskStatus::Failed;
        failed.attempts = 3;
        store.create(failed).await.unwrap();

        run_now(&store, &["f1".to_string()]).await.unwrap();

        let task = store.get("f1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        assert_eq!(task.attempts, 0);
        assert!(task.run_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_run_now_refuses_live_claim() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut running = task("r1");
        running.status = TaskStatus::Running;
        running.owner_id = Some("worker-1".into());
        running.retry_at = Some(Utc::now() + chrono::Duration::minutes(5));
        store.create(running).await.unwrap();

        assert!(run_now(&store, &["r1".to_string()]).await.is_err());
        assert!(remove(&store, &["r1".to_string()], false).await.is_err());
        assert_eq!(
            store.get("r1").await.unwrap().status,
            TaskStatus::Running
        );

        remove(&store, &["r1".to_string()], true).await.unwrap();
        assert!(store.get("r1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_run_now_refuses_expired_claim() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut stale = task("c1");
        stale.status = TaskStatus::Claiming;
        stale.owner_id = Some("worker-gone".into());
        stale.retry_at = Some(Utc::now() - chrono::Duration::minutes(5));
        store.create(stale).await.unwrap();

        assert!(run_now(&store, &["c1".to_string()]).await.is_err());
        let task = store.get("c1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Claiming);
        assert_eq!(task.owner_id.as_deref(), Some("worker-gone"));

        // Removal only needs --force while the claim is live.
        remove(&store, &["c1".to_string()], false).await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.create(task("a")).await.unwrap();

        let ids = vec!["a".to_string(), "missing".to_string()];
        assert!(set_enabled(&store, &ids, false, false).await.is_err());
        assert!(!store.get("a").await.unwrap().enabled);

        set_enabled(&store, &ids[..1], true, true).await.unwrap();
        let task = store.get("a").await.unwrap();
        assert!(task.enabled);
        assert!(task.run_at <= Utc::now());
    }
}
