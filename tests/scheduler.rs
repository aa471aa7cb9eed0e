//! Scheduler scenarios: validation, firing, and persistence across restarts.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opsrunner::executor::{AnsibleLauncher, Executor, ExecutorConfig, JobRequest};
use opsrunner::runner::{ProcessRunner, RunnerConfig};
use opsrunner::scheduler::{ScheduleError, ScheduleStore, Scheduler};
use opsrunner::storage::{open_pool, ExecutionStore, Filters, Pool, StoreConfig};
use tempfile::TempDir;

fn setup(dir: &Path) -> (Pool, Executor, Scheduler) {
    let pool = open_pool(dir.join("sched.db").to_str().unwrap()).unwrap();
    let store = ExecutionStore::open(pool.clone(), StoreConfig::default()).unwrap();
    let executor = Executor::new(
        store,
        ProcessRunner::new(RunnerConfig::default()),
        Arc::new(AnsibleLauncher::new(dir)),
        ExecutorConfig::default(),
    );
    let scheduler = Scheduler::new(pool.clone(), executor.clone());
    (pool, executor, scheduler)
}

#[tokio::test]
async fn test_invalid_cron_is_rejected_and_nothing_registers() {
    let dir = TempDir::new().unwrap();
    let (pool, _executor, scheduler) = setup(dir.path());

    let err = scheduler
        .create_schedule("bad", "invalid", JobRequest::command(["true"], None))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::InvalidCronExpr { .. }));

    assert!(scheduler.list_schedules().is_empty());
    assert!(ScheduleStore::new(pool).load_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_template_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (_pool, _executor, scheduler) = setup(dir.path());

    let empty: [&str; 0] = [];
    let err = scheduler
        .create_schedule("empty", "0 * * * *", JobRequest::command(empty, None))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::InvalidTemplate(_)));
    assert!(scheduler.list_schedules().is_empty());
}

#[tokio::test]
async fn test_every_second_schedule_fires_and_stops_after_delete() {
    let dir = TempDir::new().unwrap();
    let (_pool, executor, scheduler) = setup(dir.path());

    let task = scheduler
        .create_schedule("tick", "* * * * * *", JobRequest::command(["echo", "tick"], None))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut fired = Vec::new();
    while fired.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        fired = executor.list(Filters::default()).await.unwrap();
    }
    assert!(!fired.is_empty(), "schedule never fired");

    scheduler.delete_schedule(&task.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after_delete = executor.list(Filters::default()).await.unwrap().len();
    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert_eq!(executor.list(Filters::default()).await.unwrap().len(), after_delete);

    assert!(matches!(
        scheduler.delete_schedule(&task.id).await,
        Err(ScheduleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_schedules_survive_restart() {
    let dir = TempDir::new().unwrap();
    let created = {
        let (_pool, _executor, scheduler) = setup(dir.path());
        let task = scheduler
            .create_schedule("nightly", "0 2 * * *", JobRequest::command(["true"], None))
            .await
            .unwrap();
        scheduler.shutdown();
        task
    };

    let (_pool, _executor, scheduler) = setup(dir.path());
    assert_eq!(scheduler.restore().await.unwrap(), 1);

    let listed = scheduler.list_schedules();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);
    assert_eq!(listed[0].template, created.template);
    assert!(listed[0].next_run.is_some());

    let upcoming = scheduler.preview_next_runs(48).unwrap();
    assert!(upcoming.len() >= 1);
    assert!(upcoming.iter().all(|run| run.schedule_id == created.id));
}
