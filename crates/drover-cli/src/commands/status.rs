//! Status command implementation

use anyhow::{Context, Result};
use chrono::Utc;
use drover::prelude::*;
use drover::TaskClause;
use drover_sqlite::SqliteTaskStore;

pub async fn execute(store: &SqliteTaskStore, config: &TaskManagerConfig) -> Result<()> {
    tracing::info!("Checking task store status");

    let counts = store
        .count_by_status()
        .await
        .context("Failed to count tasks")?;

    println!("\nTask Store Status");
    println!("{}", "=".repeat(60));

    let total: u64 = counts.iter().map(|(_, n)| n).sum();
    for (status, count) in &counts {
        println!("  {:<14} {}", status.as_str(), count);
    }
    println!("  {:<14} {}", "total", total);

    let now = Utc::now();
    let due = TaskClause::new()
        .with_statuses([TaskStatus::Idle])
        .run_at_lte(now);
    let expired = TaskClause::new()
        .with_statuses([TaskStatus::Claiming, TaskStatus::Running])
        .retry_at_lt(now);

    let due_count = count_matching(store, due, config).await?;
    let expired_count = count_matching(store, expired, config).await?;

    println!("\nClaimable Now:");
    println!("  Due idle tasks:  {}", due_count);
    println!("  Expired claims:  {}", expired_count);
    if !config.exclude_task_types.is_empty() {
        println!("  Excluding:       {}", config.exclude_task_types.join(", "));
    }

    if expired_count > 0 {
        println!(
            "\n⚠️  {} task(s) hold a lapsed claim; a live manager will reclaim them",
            expired_count
        );
    }

    Ok(())
}

/// Count enabled tasks matching `clause`, walking all pages.
async fn count_matching(
    store: &SqliteTaskStore,
    clause: TaskClause,
    config: &TaskManagerConfig,
) -> Result<usize> {
    let mut query = TaskQuery::new()
        .or(clause)
        .enabled_only()
        .excluding(config.exclude_task_types.iter().cloned())
        .with_size(config.claim_page_size);

    let mut count = 0;
    loop {
        let page = store.query(&query).await.context("Failed to query tasks")?;
        count += page.tasks.len();
        match page.next {
            Some(cursor) => query.search_after = Some(cursor),
            None => return Ok(count),
        }
    }
}
