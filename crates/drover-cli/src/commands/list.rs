//! List and show command implementations

use anyhow::{Context, Result};
use drover::prelude::*;
use drover::TaskClause;
use drover_sqlite::SqliteTaskStore;

pub async fn list(
    store: &SqliteTaskStore,
    status: Option<String>,
    task_type: Option<String>,
    limit: usize,
) -> Result<()> {
    let mut clause = TaskClause::new();
    if let Some(status) = status {
        let status: TaskStatus = status
            .parse()
            .with_context(|| format!("Unknown status '{}'", status))?;
        clause = clause.with_statuses([status]);
    }
    if let Some(task_type) = task_type {
        clause = clause.with_task_type(task_type);
    }

    let query = TaskQuery::new().or(clause).with_size(limit.max(1));
    let page = store.query(&query).await.context("Failed to query tasks")?;

    if page.tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }

    println!(
        "\n{:<38} {:<24} {:<13} {:<9} {:<8} Run At",
        "ID", "Type", "Status", "Attempts", "Enabled"
    );
    println!("{}", "=".repeat(120));

    for task in &page.tasks {
        println!(
            "{:<38} {:<24} {:<13} {:<9} {:<8} {}",
            task.id,
            task.task_type,
            task.status.as_str(),
            task.attempts,
            if task.enabled { "yes" } else { "no" },
            task.run_at.to_rfc3339()
        );
    }

    println!("\nShown: {} task(s)", page.tasks.len());
    if page.next.is_some() {
        println!("More tasks match; raise --limit to see them");
    }

    Ok(())
}

pub async fn show(store: &SqliteTaskStore, id: &str) -> Result<()> {
    let task = store
        .get(id)
        .await
        .with_context(|| format!("Failed to load task {}", id))?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}
