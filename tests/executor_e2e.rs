//! End-to-end executor scenarios against real child processes.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opsrunner::executor::{
    AnsibleLauncher, Executor, ExecutorConfig, JobRequest, OutputEvent, PlaybookRequest,
};
use opsrunner::model::{ExecutionRecord, ExecutionStatus, JobKind};
use opsrunner::runner::{ProcessRunner, RunnerConfig};
use opsrunner::storage::{open_pool, ExecutionStore, Filters, StoreConfig};
use tempfile::TempDir;

fn executor_with(dir: &Path, launcher: AnsibleLauncher) -> Executor {
    let pool = open_pool(dir.join("e2e.db").to_str().unwrap()).unwrap();
    let store = ExecutionStore::open(pool, StoreConfig::default()).unwrap();
    let runner = ProcessRunner::new(RunnerConfig {
        log_dir: Some(dir.join("logs")),
        kill_grace: Duration::from_secs(1),
    });
    Executor::new(store, runner, Arc::new(launcher), ExecutorConfig::default())
}

fn executor(dir: &TempDir) -> Executor {
    executor_with(dir.path(), AnsibleLauncher::new(dir.path()))
}

async fn wait_terminal(executor: &Executor, id: &str, limit: Duration) -> ExecutionRecord {
    let deadline = Instant::now() + limit;
    loop {
        let record = executor.get(id).await.unwrap();
        if record.status.is_terminal() {
            return record;
        }
        assert!(Instant::now() < deadline, "execution {id} still running");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_echo_succeeds_with_output() {
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir);

    let id = exec
        .submit(&JobRequest::command(["echo", "hello"], None))
        .await
        .unwrap();
    let record = wait_terminal(&exec, &id, Duration::from_secs(10)).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.kind, JobKind::SingleCommand);
    assert_eq!(record.exit_code, 0);
    assert_eq!(record.output, vec!["hello".to_string()]);
    assert!(record.end_time.is_some());
    assert!(record.duration >= 0.0);

    // Side log written next to the store.
    let log = std::fs::read_to_string(dir.path().join("logs").join(format!("{id}.log"))).unwrap();
    assert!(log.contains("hello"));
}

#[tokio::test]
async fn test_timeout_cancels_promptly() {
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir);

    let started = Instant::now();
    let id = exec
        .submit(&JobRequest::command(["sleep", "5"], Some(1)))
        .await
        .unwrap();
    let record = wait_terminal(&exec, &id, Duration::from_secs(4)).await;

    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(record
        .output
        .iter()
        .any(|l| l.contains("timed out after 1s")));
}

#[tokio::test]
async fn test_concurrent_submissions_are_independent() {
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir);

    let first = JobRequest::command(["sh", "-c", "echo first"], None);
    let second = JobRequest::command(["sh", "-c", "echo second"], None);
    let (a, b) = tokio::join!(exec.submit(&first), exec.submit(&second));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a, b);

    let ra = wait_terminal(&exec, &a, Duration::from_secs(10)).await;
    let rb = wait_terminal(&exec, &b, Duration::from_secs(10)).await;
    assert_eq!(ra.output, vec!["first".to_string()]);
    assert_eq!(rb.output, vec!["second".to_string()]);

    let all = exec.list(Filters::default()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_cancel_running_then_cancel_again() {
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir);

    let id = exec
        .submit(&JobRequest::command(["sleep", "30"], None))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    exec.cancel(&id).await.unwrap();
    let record = exec.get(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.exit_code, -1);

    exec.cancel(&id).await.unwrap();
    assert_eq!(exec.active_count(), 0);
}

#[tokio::test]
async fn test_attach_streams_lines_then_completion() {
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir);

    let id = exec
        .submit(&JobRequest::command(
            ["sh", "-c", "for i in 1 2 3; do echo line$i; sleep 0.05; done"],
            None,
        ))
        .await
        .unwrap();
    let mut rx = exec.attach(&id).expect("broker registered");

    let mut lines = Vec::new();
    let completed = loop {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
        {
            Some(OutputEvent::Line(line)) => lines.push(line),
            Some(OutputEvent::Completed(record)) => break record,
            None => panic!("stream ended without completion"),
        }
    };

    assert_eq!(lines, vec!["line1", "line2", "line3"]);
    assert_eq!(completed.status, ExecutionStatus::Success);
    assert_eq!(completed.output, lines);
}

#[tokio::test]
async fn test_playbook_run_records_recap_and_metadata() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("playbooks")).unwrap();
    std::fs::create_dir_all(dir.path().join("inventory")).unwrap();
    std::fs::write(dir.path().join("inventory/hosts"), "web1\ndb1\n").unwrap();
    // The "playbook" is a shell script run by `sh`, standing in for the tool.
    std::fs::write(
        dir.path().join("playbooks/site.yml"),
        "echo 'PLAY RECAP'\n\
         echo 'web1 : ok=3 changed=1 unreachable=0 failed=0 skipped=0 rescued=0 ignored=0'\n\
         echo 'db1 : ok=1 changed=0 unreachable=0 failed=1 skipped=0 rescued=0 ignored=0'\n\
         exit 2\n",
    )
    .unwrap();

    let launcher = AnsibleLauncher::new(dir.path()).with_binaries("sh", "sh");
    let exec = executor_with(dir.path(), launcher);

    let request = JobRequest::Playbook(PlaybookRequest {
        playbook: "site.yml".into(),
        inventory: "hosts".into(),
        limit: Some("web1,db1".into()),
        tags: vec!["deploy".into()],
        ..PlaybookRequest::default()
    });
    let id = exec.submit(&request).await.unwrap();
    let record = wait_terminal(&exec, &id, Duration::from_secs(10)).await;

    assert_eq!(record.kind, JobKind::BatchRun);
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.exit_code, 2);
    assert_eq!(record.job_name.as_deref(), Some("site.yml"));
    assert_eq!(record.target.as_deref(), Some("hosts"));
    assert!(record.changed);
    assert_eq!(record.failed_hosts, vec!["db1".to_string()]);
    assert_eq!(record.per_host_stats["web1"].ok, 3);

    let meta = exec.store().metadata(&id).unwrap().expect("metadata stored");
    assert_eq!(meta.limit.as_deref(), Some("web1,db1"));
    assert_eq!(meta.tags, vec!["deploy".to_string()]);

    let failed = exec
        .list(Filters {
            only_failed: true,
            ..Filters::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn test_retention_removes_finished_history() {
    let dir = TempDir::new().unwrap();
    let exec = executor(&dir);

    let id = exec
        .submit(&JobRequest::command(["true"], None))
        .await
        .unwrap();
    wait_terminal(&exec, &id, Duration::from_secs(10)).await;

    let deleted = exec.store().cleanup(0).unwrap();
    assert_eq!(deleted, 1);
    assert!(exec.get(&id).await.is_err());
}
