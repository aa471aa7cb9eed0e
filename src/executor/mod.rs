//! Job execution: submission, live output, cancellation, finalization.
//!
//! Each submitted job gets a persisted `running` record before anything is
//! spawned, one process, and one reader task per output pipe. When the
//! process ends the readers are joined, the record is finalized with parsed
//! recap statistics, and the final state is saved.

pub mod broker;
pub mod launcher;
pub mod stats;

pub use self::broker::{BrokerConfig, OutputBroker, OutputEvent};
pub use self::launcher::{
    AdHocRequest, AnsibleLauncher, CommandRequest, JobLauncher, JobRequest, LaunchPlan,
    PlaybookRequest,
};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::{ExecutionRecord, ExecutionStatus};
use crate::runner::{CommandSpec, LineStream, ProcessRunner, RunnerError};
use crate::storage::{ExecutionStore, Filters, Statistics, StoreError};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("execution {0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for ExecError {
    fn from(e: tokio::task::JoinError) -> Self {
        ExecError::Internal(e.to_string())
    }
}

fn not_found_or(e: StoreError) -> ExecError {
    match e {
        StoreError::NotFound(id) => ExecError::NotFound(id),
        other => ExecError::Persistence(other),
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub broker: BrokerConfig,
    /// How long a finished execution's broker stays attachable.
    pub stream_grace: Duration,
    /// How long to wait for output readers once the process has exited.
    pub drain_grace: Duration,
    /// How long `cancel` and `shutdown` wait for finalization.
    pub cancel_wait: Duration,
    /// Attempts at persisting the final record before giving up.
    pub persist_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            stream_grace: Duration::from_secs(300),
            drain_grace: Duration::from_secs(5),
            cancel_wait: Duration::from_secs(15),
            persist_attempts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Bookkeeping for an execution whose process has not been finalized yet.
#[derive(Clone)]
struct LiveJob {
    cancel: CancellationToken,
    output: Arc<Mutex<Vec<String>>>,
    done: watch::Receiver<bool>,
}

struct Inner {
    store: ExecutionStore,
    runner: ProcessRunner,
    launcher: Arc<dyn JobLauncher>,
    config: ExecutorConfig,
    /// Live output brokers, kept for `stream_grace` after completion.
    brokers: Mutex<HashMap<String, Arc<OutputBroker>>>,
    /// Executions still running, keyed by id.
    live: Mutex<HashMap<String, LiveJob>>,
}

/// Cheap to clone; all clones share the same registries.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(
        store: ExecutionStore,
        runner: ProcessRunner,
        launcher: Arc<dyn JobLauncher>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                launcher,
                config,
                brokers: Mutex::new(HashMap::new()),
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.inner.store
    }

    pub fn launcher(&self) -> &Arc<dyn JobLauncher> {
        &self.inner.launcher
    }

    /// Number of executions with a live process.
    pub fn active_count(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Validate and start `request`, returning the new execution id.
    ///
    /// Returns once the initial `running` record is durable; the job itself
    /// runs in the background. If that first save fails nothing is started.
    pub async fn submit(&self, request: &JobRequest) -> Result<String, ExecError> {
        let plan = self.inner.launcher.prepare(request)?;
        self.submit_plan(plan).await
    }

    /// Start an already prepared plan.
    pub async fn submit_plan(&self, plan: LaunchPlan) -> Result<String, ExecError> {
        let id = Uuid::new_v4().to_string();
        let mut record = ExecutionRecord::started(id.clone(), plan.kind);
        record.job_name = plan.job_name.clone();
        record.target = plan.target.clone();

        let store = self.inner.store.clone();
        let initial = record.clone();
        let metadata = plan.metadata;
        tokio::task::spawn_blocking(move || store.save(&initial, metadata.as_ref())).await??;

        let cancel = CancellationToken::new();
        let output = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = watch::channel(false);
        let broker = Arc::new(OutputBroker::new(id.clone(), self.inner.config.broker.clone()));

        self.inner.brokers.lock().insert(id.clone(), broker.clone());
        self.inner.live.lock().insert(
            id.clone(),
            LiveJob {
                cancel: cancel.clone(),
                output: output.clone(),
                done: done_rx,
            },
        );

        info!(
            execution_id = %id,
            kind = %plan.kind,
            job = plan.job_name.as_deref().unwrap_or("-"),
            "execution submitted"
        );

        let exec = self.clone();
        let job = Job {
            record,
            command: plan.command,
            cancel,
            output,
            broker,
            done: done_tx,
        };
        tokio::spawn(async move { exec.drive(job).await });

        Ok(id)
    }

    /// Current state of an execution. While it runs, the output captured so
    /// far is included.
    pub async fn get(&self, id: &str) -> Result<ExecutionRecord, ExecError> {
        let store = self.inner.store.clone();
        let key = id.to_string();
        let mut record = tokio::task::spawn_blocking(move || store.get(&key))
            .await?
            .map_err(not_found_or)?;
        self.overlay_live(&mut record);
        Ok(record)
    }

    pub async fn list(&self, filters: Filters) -> Result<Vec<ExecutionRecord>, ExecError> {
        let store = self.inner.store.clone();
        let mut records = tokio::task::spawn_blocking(move || store.list(&filters)).await??;
        for record in &mut records {
            self.overlay_live(record);
        }
        Ok(records)
    }

    pub async fn statistics(&self, window: chrono::Duration) -> Result<Statistics, ExecError> {
        let store = self.inner.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.statistics(window)).await??)
    }

    /// Stop a running execution and wait (bounded) for it to be finalized.
    ///
    /// Cancelling an execution that already ended as `cancelled` is a no-op.
    /// Any other id without a live process is `NotFound`.
    pub async fn cancel(&self, id: &str) -> Result<(), ExecError> {
        let live = self.inner.live.lock().get(id).cloned();
        match live {
            Some(job) => {
                info!(execution_id = id, "cancelling execution");
                job.cancel.cancel();
                if tokio::time::timeout(self.inner.config.cancel_wait, wait_done(job.done))
                    .await
                    .is_err()
                {
                    warn!(execution_id = id, "execution not finalized within cancel wait");
                }
                Ok(())
            }
            None => {
                let record = self.get(id).await?;
                if record.status == ExecutionStatus::Cancelled {
                    debug!(execution_id = id, "execution already cancelled");
                    Ok(())
                } else {
                    Err(ExecError::NotFound(id.to_string()))
                }
            }
        }
    }

    /// Subscribe to an execution's live output.
    ///
    /// Available while the job runs and for a grace period afterwards.
    pub fn attach(&self, id: &str) -> Option<mpsc::Receiver<OutputEvent>> {
        let broker = self.inner.brokers.lock().get(id).cloned();
        broker.map(|b| b.subscribe())
    }

    /// Cancel every running execution and wait for each to be finalized.
    pub async fn shutdown(&self) {
        let jobs: Vec<LiveJob> = self.inner.live.lock().values().cloned().collect();
        if jobs.is_empty() {
            return;
        }
        info!(count = jobs.len(), "cancelling running executions for shutdown");
        for job in &jobs {
            job.cancel.cancel();
        }
        for job in jobs {
            let _ = tokio::time::timeout(self.inner.config.cancel_wait, wait_done(job.done)).await;
        }
    }

    /// Finalize records left `running` by a previous process.
    ///
    /// Such records have no live process behind them anymore. They are
    /// marked `failed` with exit code -1 so they stop showing as running
    /// and become eligible for retention.
    pub async fn recover_orphans(&self) -> Result<usize, ExecError> {
        let store = self.inner.store.clone();
        let live: HashSet<String> = self.inner.live.lock().keys().cloned().collect();

        let recovered = tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            let running = store.list(&Filters {
                status: Some(ExecutionStatus::Running),
                ..Filters::default()
            })?;
            let mut count = 0;
            for mut record in running.into_iter().filter(|r| !live.contains(&r.id)) {
                record
                    .output
                    .push("execution interrupted: runner restarted before it finished".into());
                record.finish(ExecutionStatus::Failed, -1, Utc::now());
                store.save(&record, None)?;
                count += 1;
            }
            Ok(count)
        })
        .await??;

        if recovered > 0 {
            warn!(recovered, "marked orphaned executions as failed");
        }
        Ok(recovered)
    }

    fn overlay_live(&self, record: &mut ExecutionRecord) {
        if record.status != ExecutionStatus::Running {
            return;
        }
        let output = self
            .inner
            .live
            .lock()
            .get(&record.id)
            .map(|job| job.output.clone());
        if let Some(output) = output {
            record.output = output.lock().clone();
        }
    }

    async fn drive(self, job: Job) {
        let Job {
            mut record,
            command,
            cancel,
            output,
            broker,
            done,
        } = job;
        let id = record.id.clone();

        let outcome = if cancel.is_cancelled() {
            Err(RunnerError::Cancelled)
        } else {
            self.run(&id, &command, cancel, &output, &broker).await
        };

        let (status, exit_code, note) = match outcome {
            Ok(0) => (ExecutionStatus::Success, 0, None),
            Ok(code) => (ExecutionStatus::Failed, code, None),
            Err(RunnerError::Cancelled) => (
                ExecutionStatus::Cancelled,
                -1,
                Some("execution cancelled".to_string()),
            ),
            // A deadline stop is reported like an explicit cancel.
            Err(RunnerError::TimedOut { after }) => (
                ExecutionStatus::Cancelled,
                -1,
                Some(format!("execution timed out after {}s", after.as_secs())),
            ),
            Err(e) => (ExecutionStatus::Failed, -1, Some(e.to_string())),
        };

        if let Some(note) = note {
            output.lock().push(note.clone());
            broker.publish(&note).await;
        }

        record.output = output.lock().clone();
        record.finish(status, exit_code, Utc::now());
        stats::extract(record.output.as_slice()).apply(&mut record);

        self.persist_final(&record).await;
        broker.close(&record).await;

        self.inner.live.lock().remove(&id);
        let _ = done.send(true);

        info!(
            execution_id = %id,
            status = %record.status,
            exit_code = record.exit_code,
            duration_sec = record.duration,
            lines = record.output.len(),
            "execution finished"
        );

        schedule_broker_release(
            Arc::downgrade(&self.inner),
            id,
            self.inner.config.stream_grace,
        );
    }

    /// Spawn the process, pump both pipes, and wait for it to end.
    async fn run(
        &self,
        id: &str,
        command: &CommandSpec,
        cancel: CancellationToken,
        output: &Arc<Mutex<Vec<String>>>,
        broker: &Arc<OutputBroker>,
    ) -> Result<i32, RunnerError> {
        let mut process = self.inner.runner.start(id, command, cancel)?;

        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = process.take_stdout() {
            readers.push(tokio::spawn(pump(stdout, output.clone(), broker.clone(), id.to_string())));
        }
        if let Some(stderr) = process.take_stderr() {
            readers.push(tokio::spawn(pump(stderr, output.clone(), broker.clone(), id.to_string())));
        }

        let result = process.wait().await;

        for mut reader in readers {
            if tokio::time::timeout(self.inner.config.drain_grace, &mut reader)
                .await
                .is_err()
            {
                warn!(execution_id = id, "output reader still open after exit, abandoning it");
                reader.abort();
            }
        }

        result
    }

    async fn persist_final(&self, record: &ExecutionRecord) {
        let attempts = self.inner.config.persist_attempts.max(1);
        for attempt in 1..=attempts {
            let store = self.inner.store.clone();
            let snapshot = record.clone();
            match tokio::task::spawn_blocking(move || store.save(&snapshot, None)).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    warn!(execution_id = %record.id, attempt, error = %e, "failed to persist final execution state");
                }
                Err(e) => {
                    warn!(execution_id = %record.id, attempt, error = %e, "persist task failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
        }
        error!(
            execution_id = %record.id,
            status = %record.status,
            "giving up on persisting final execution state"
        );
    }
}

/// Everything `drive` owns for one execution.
struct Job {
    record: ExecutionRecord,
    command: CommandSpec,
    cancel: CancellationToken,
    output: Arc<Mutex<Vec<String>>>,
    broker: Arc<OutputBroker>,
    done: watch::Sender<bool>,
}

/// Drain one pipe into the record's output and the broker.
///
/// A read error ends the stream and is recorded as an output line; it does
/// not decide the execution's status.
async fn pump<R: AsyncRead + Unpin>(
    mut stream: LineStream<R>,
    output: Arc<Mutex<Vec<String>>>,
    broker: Arc<OutputBroker>,
    execution_id: String,
) {
    loop {
        match stream.next_line().await {
            Ok(Some(line)) => {
                output.lock().push(line.clone());
                broker.publish(&line).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "output stream failed");
                let line = format!("output stream error: {}", e);
                output.lock().push(line.clone());
                broker.publish(&line).await;
                break;
            }
        }
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    while !*done.borrow_and_update() {
        if done.changed().await.is_err() {
            return;
        }
    }
}

fn schedule_broker_release(inner: Weak<Inner>, id: String, grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if let Some(inner) = inner.upgrade() {
            inner.brokers.lock().remove(&id);
            debug!(execution_id = %id, "released output broker");
        }
    });
}
