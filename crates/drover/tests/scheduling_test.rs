//! The scheduling API: create, update, run now, ephemeral runs and bulk operations.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use drover::prelude::*;
use serde_json::json;
use std::sync::atomic::Ordering;

fn counter_manager() -> (TaskManager, Arc<std::sync::atomic::AtomicUsize>) {
    let (handler, runs) = CountingHandler::new("counter");
    let manager = TaskManager::builder(store())
        .with_config(test_config())
        .with_task_handler(handler)
        .build()
        .unwrap();
    (manager, runs)
}

#[tokio::test]
async fn test_schedule_fills_defaults() {
    let (manager, _) = counter_manager();
    let before = Utc::now();
    let task = manager
        .scheduling()
        .schedule(TaskInstance::new("counter").with_params(json!({ "to": "ops" })))
        .await
        .unwrap();

    assert!(!task.id.is_empty());
    assert_eq!(task.status, TaskStatus::Idle);
    assert_eq!(task.attempts, 0);
    assert!(task.enabled);
    assert_eq!(task.priority, TaskPriority::Normal.value());
    assert_eq!(task.params, json!({ "to": "ops" }));
    assert_between(task.run_at, before, Utc::now());
    assert_eq!(task.scheduled_at, task.run_at);
}

#[tokio::test]
async fn test_schedule_validation() {
    let (manager, _) = counter_manager();
    let scheduling = manager.scheduling();

    let err = scheduling
        .schedule(TaskInstance::new("unknown"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::UnregisteredTaskType(_)));

    let err = scheduling
        .schedule(TaskInstance::new("counter").with_schedule(Schedule::interval("5x")))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::InvalidSchedule(_)));

    let err = scheduling
        .schedule(TaskInstance::new("counter").with_params(json!({ "invalid": true })))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::InvalidTask(_)));

    scheduling
        .schedule(TaskInstance::new("counter").with_id("dup"))
        .await
        .unwrap();
    let err = scheduling
        .schedule(TaskInstance::new("counter").with_id("dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::TaskAlreadyExists(_)));
}

#[tokio::test]
async fn test_ensure_scheduled_is_idempotent() {
    let (manager, _) = counter_manager();
    let scheduling = manager.scheduling();

    let first = scheduling
        .ensure_scheduled(
            TaskInstance::new("counter")
                .with_id("cleanup")
                .with_schedule(Schedule::interval("1h"))
                .with_params(json!({ "days": 7 })),
        )
        .await
        .unwrap();
    let second = scheduling
        .ensure_scheduled(
            TaskInstance::new("counter")
                .with_id("cleanup")
                .with_schedule(Schedule::interval("1h"))
                .with_params(json!({ "days": 30 })),
        )
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.run_at, first.run_at);
    assert_eq!(second.params, json!({ "days": 30 }));
    assert_ne!(second.version, first.version);

    let page = scheduling.fetch(&TaskQuery::new()).await.unwrap();
    assert_eq!(page.tasks.len(), 1);
}

#[tokio::test]
async fn test_ensure_scheduled_refuses_claimed_task() {
    let shared = store();
    let (handler, _) = CountingHandler::new("counter");
    let manager = TaskManager::builder(shared.clone())
        .with_config(test_config())
        .with_task_handler(handler)
        .build()
        .unwrap();

    let mut task = raw_task("busy", "counter");
    task.status = TaskStatus::Running;
    task.owner_id = Some("someone".into());
    task.retry_at = Some(Utc::now() + ChronoDuration::minutes(5));
    shared.create(task).await.unwrap();

    let err = manager
        .scheduling()
        .ensure_scheduled(TaskInstance::new("counter").with_id("busy"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::TaskNotIdle { .. }));

    let err = manager
        .scheduling()
        .ensure_scheduled(TaskInstance::new("counter"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::InvalidTask(_)));
}

#[tokio::test]
async fn test_run_now_on_running_task_is_rejected() {
    let (handler, started, gate) = GatedHandler::new("gated");
    let manager = TaskManager::builder(store())
        .with_config(test_config())
        .with_task_handler(handler)
        .build()
        .unwrap();
    let scheduling = manager.scheduling();

    scheduling
        .schedule(
            TaskInstance::new("gated")
                .with_id("r1")
                .with_schedule(Schedule::interval("1h")),
        )
        .await
        .unwrap();
    manager.poll_once().await.unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;

    let before = scheduling.get("r1").await.unwrap();
    assert_eq!(before.status, TaskStatus::Running);

    let err = scheduling.run_now("r1").await.unwrap_err();
    assert!(matches!(
        err,
        TaskManagerError::TaskNotIdle {
            status: TaskStatus::Running,
            ..
        }
    ));
    let after = scheduling.get("r1").await.unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.run_at, before.run_at);

    gate.add_permits(1);
    manager.pool().wait_for_idle().await;
}

#[tokio::test]
async fn test_run_now_makes_task_due() {
    let (manager, runs) = counter_manager();
    let scheduling = manager.scheduling();

    scheduling
        .schedule(
            TaskInstance::new("counter")
                .with_id("later")
                .with_run_at(Utc::now() + ChronoDuration::days(1)),
        )
        .await
        .unwrap();
    let task = scheduling.run_now("later").await.unwrap();
    assert!(task.run_at <= Utc::now());

    poll_and_drain(&manager).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let err = scheduling.run_now("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_run_now_rejects_disabled_task() {
    let (manager, _) = counter_manager();
    let scheduling = manager.scheduling();

    scheduling
        .schedule(TaskInstance::new("counter").with_id("off").with_enabled(false))
        .await
        .unwrap();
    let err = scheduling.run_now("off").await.unwrap_err();
    assert!(matches!(err, TaskManagerError::TaskDisabled(_)));
}

#[tokio::test]
async fn test_ephemeral_run_returns_state_and_stores_nothing() {
    let (manager, runs) = counter_manager();
    let result = manager
        .scheduling()
        .ephemeral_run_now(EphemeralTask::new("counter").with_state(json!({ "runs": 4 })))
        .await
        .unwrap();

    assert!(result.id.starts_with("ephemeral-"));
    assert_eq!(result.state, json!({ "runs": 5 }));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(manager.pool().used_capacity(), 0);

    let page = manager.scheduling().fetch(&TaskQuery::new()).await.unwrap();
    assert!(page.tasks.is_empty());
}

#[tokio::test]
async fn test_ephemeral_run_needs_capacity() {
    let (handler, runs) = CountingHandler::new("counter");
    let manager = TaskManager::builder(store())
        .with_config(test_config().with_capacity(2))
        .with_task_handler(handler)
        .build()
        .unwrap();

    let definition = manager.registry().definition("counter").unwrap().clone();
    let permit = manager.pool().try_admit(&definition).unwrap();

    let err = manager
        .scheduling()
        .ephemeral_run_now(EphemeralTask::new("counter"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::CapacityExhausted { .. }));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    drop(permit);
    manager
        .scheduling()
        .ephemeral_run_now(EphemeralTask::new("counter"))
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ephemeral_run_reports_handler_failure() {
    let manager = TaskManager::builder(store())
        .with_config(test_config())
        .with_task_handler(FailingHandler::retryable("flaky"))
        .build()
        .unwrap();

    let err = manager
        .scheduling()
        .ephemeral_run_now(EphemeralTask::new("flaky"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::TaskRunFailed(_)));
}

#[tokio::test]
async fn test_bulk_update_schedules_shifts_run_at() {
    let shared = store();
    let (handler, _) = CountingHandler::new("counter");
    let manager = TaskManager::builder(shared.clone())
        .with_config(test_config())
        .with_task_handler(handler)
        .build()
        .unwrap();
    let scheduling = manager.scheduling();

    let now = Utc::now();
    let next = now + ChronoDuration::minutes(3);
    scheduling
        .schedule(
            TaskInstance::new("counter")
                .with_id("five")
                .with_schedule(Schedule::interval("5m"))
                .with_run_at(next),
        )
        .await
        .unwrap();

    let mut owned = raw_task("owned", "counter");
    owned.status = TaskStatus::Claiming;
    owned.owner_id = Some("someone".into());
    owned.retry_at = Some(now + ChronoDuration::minutes(1));
    owned.schedule = Some(Schedule::interval("5m"));
    shared.create(owned).await.unwrap();

    let ids = vec!["five".to_string(), "owned".to_string(), "missing".to_string()];
    let results = scheduling
        .bulk_update_schedules(&ids, Schedule::interval("10m"))
        .await
        .unwrap();

    let five = results["five"].as_ref().unwrap();
    assert_eq!(five.schedule, Some(Schedule::interval("10m")));
    assert_between(
        five.run_at,
        next + ChronoDuration::minutes(5),
        next + ChronoDuration::minutes(5),
    );
    assert!(matches!(
        results["owned"],
        Err(TaskManagerError::TaskNotIdle { .. })
    ));
    assert!(results["missing"].as_ref().unwrap_err().is_not_found());

    // Shortening never moves the next run into the past.
    let results = scheduling
        .bulk_update_schedules(&ids[..1], Schedule::interval("1m"))
        .await
        .unwrap();
    let five = results["five"].as_ref().unwrap();
    assert!(five.run_at >= now);

    let err = scheduling
        .bulk_update_schedules(&ids, Schedule::interval("0m"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::InvalidSchedule(_)));
}

#[tokio::test]
async fn test_bulk_disable_enable_and_remove() {
    let (manager, _) = counter_manager();
    let scheduling = manager.scheduling();

    let results = scheduling
        .bulk_schedule(vec![
            TaskInstance::new("counter").with_id("a"),
            TaskInstance::new("counter").with_id("b"),
            TaskInstance::new("unknown").with_id("c"),
        ])
        .await;
    assert!(results["a"].is_ok());
    assert!(results["b"].is_ok());
    assert!(matches!(
        results["c"],
        Err(TaskManagerError::UnregisteredTaskType(_))
    ));

    let ids = vec!["a".to_string(), "b".to_string()];
    let disabled = scheduling.bulk_disable(&ids).await.unwrap();
    assert!(disabled.values().all(|r| matches!(r, Ok(t) if !t.enabled)));
    assert_eq!(poll_and_drain(&manager).await.claim.claimed, 0);

    let enabled = scheduling.bulk_enable(&ids[..1], false).await.unwrap();
    assert!(enabled["a"].as_ref().unwrap().enabled);

    let removed = scheduling
        .bulk_remove(&["a".to_string(), "missing".to_string()])
        .await;
    assert!(removed["a"].is_ok());
    assert!(removed["missing"].as_ref().unwrap_err().is_not_found());

    scheduling.remove("b").await.unwrap();
    let page = scheduling.fetch(&TaskQuery::new()).await.unwrap();
    assert!(page.tasks.is_empty());
}

#[tokio::test]
async fn test_fetch_filters_by_clause() {
    let (manager, _) = counter_manager();
    let scheduling = manager.scheduling();

    scheduling
        .schedule(TaskInstance::new("counter").with_id("due"))
        .await
        .unwrap();
    scheduling
        .schedule(
            TaskInstance::new("counter")
                .with_id("future")
                .with_run_at(Utc::now() + ChronoDuration::hours(2)),
        )
        .await
        .unwrap();

    let query = TaskQuery::new().or(drover::TaskClause::new().run_at_lte(Utc::now()));
    let page = scheduling.fetch(&query).await.unwrap();
    let ids: Vec<&str> = page.tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["due"]);
}
