//! Schedule definitions, their SQLite rows, and the per-schedule fire loops.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use parking_lot::Mutex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::executor::{Executor, JobLauncher, JobRequest};
use crate::storage::{from_db_time, to_db_time, Pool, StoreError};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCronExpr { expr: String, reason: String },

    #[error("schedule {0} not found")]
    NotFound(String),

    #[error("invalid job template: {0}")]
    InvalidTemplate(String),

    #[error("preview window of {hours}h exceeds the {max}h limit")]
    PreviewWindow { hours: u64, max: u64 },

    #[error("schedule persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for ScheduleError {
    fn from(e: rusqlite::Error) -> Self {
        ScheduleError::Persistence(e.into())
    }
}

impl From<r2d2::Error> for ScheduleError {
    fn from(e: r2d2::Error) -> Self {
        ScheduleError::Persistence(e.into())
    }
}

impl From<tokio::task::JoinError> for ScheduleError {
    fn from(e: tokio::task::JoinError) -> Self {
        ScheduleError::Internal(e.to_string())
    }
}

/// A cron-triggered job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    /// Expression as given by the caller.
    pub cron_expr: String,
    pub template: JobRequest,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// One upcoming fire time, for previews.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpcomingRun {
    pub at: DateTime<Utc>,
    pub schedule_id: String,
    pub name: String,
}

/// Accept standard 5-field expressions by prepending a seconds field.
/// Six and seven field forms are passed through unchanged.
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

pub fn parse_cron(expr: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(&normalize_cron(expr)).map_err(|e| ScheduleError::InvalidCronExpr {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Validate a schedule definition without touching any state.
pub fn validate(
    cron_expr: &str,
    template: &JobRequest,
    launcher: &dyn JobLauncher,
) -> Result<CronSchedule, ScheduleError> {
    let schedule = parse_cron(cron_expr)?;
    launcher
        .prepare(template)
        .map_err(|e| ScheduleError::InvalidTemplate(e.to_string()))?;
    Ok(schedule)
}

/// Longest window a preview may cover.
pub const MAX_PREVIEW_HOURS: u64 = 24 * 366;

/// Most fire times a preview collects per schedule.
pub const MAX_PREVIEW_RUNS: usize = 1000;

/// Fire times of `tasks` between now and `hours` from now, earliest first.
pub fn preview(tasks: &[ScheduledTask], hours: u64) -> Result<Vec<UpcomingRun>, ScheduleError> {
    let out_of_range = || ScheduleError::PreviewWindow {
        hours,
        max: MAX_PREVIEW_HOURS,
    };
    if hours > MAX_PREVIEW_HOURS {
        return Err(out_of_range());
    }
    let now = Utc::now();
    let end = i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .and_then(|window| now.checked_add_signed(window))
        .ok_or_else(out_of_range)?;
    let mut runs = Vec::new();

    for task in tasks {
        let Ok(schedule) = parse_cron(&task.cron_expr) else {
            continue;
        };
        for at in schedule.after(&now).take(MAX_PREVIEW_RUNS) {
            if at > end {
                break;
            }
            runs.push(UpcomingRun {
                at,
                schedule_id: task.id.clone(),
                name: task.name.clone(),
            });
        }
    }

    runs.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.name.cmp(&b.name)));
    Ok(runs)
}

// ---------------------------------------------------------------------------
// ScheduleStore
// ---------------------------------------------------------------------------

/// Schedule rows in SQLite. Usable without a running scheduler.
#[derive(Clone)]
pub struct ScheduleStore {
    pool: Pool,
}

impl ScheduleStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn insert(&self, task: &ScheduledTask) -> Result<(), ScheduleError> {
        let template = serde_json::to_string(&task.template).map_err(StoreError::from)?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO schedules (id, name, cron_expr, template_json, created_at, last_run_at, next_run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task.id,
                task.name,
                task.cron_expr,
                template,
                to_db_time(&task.created_at),
                task.last_run.as_ref().map(to_db_time),
                task.next_run.as_ref().map(to_db_time),
            ],
        )?;
        Ok(())
    }

    /// Returns `false` when no row had that id.
    pub fn delete(&self, id: &str) -> Result<bool, ScheduleError> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn record_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), ScheduleError> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE schedules SET last_run_at = ?2, next_run_at = ?3 WHERE id = ?1",
            params![id, to_db_time(&last_run), next_run.as_ref().map(to_db_time)],
        )?;
        Ok(())
    }

    /// Every stored schedule, oldest first. Rows whose template no longer
    /// parses are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<ScheduledTask>, ScheduleError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, cron_expr, template_json, created_at, last_run_at, next_run_at
             FROM schedules ORDER BY created_at, name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let created: String = row.get(4)?;
                let last: Option<String> = row.get(5)?;
                let next: Option<String> = row.get(6)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    from_db_time(4, &created)?,
                    last.as_deref().map(|t| from_db_time(5, t)).transpose()?,
                    next.as_deref().map(|t| from_db_time(6, t)).transpose()?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tasks = Vec::with_capacity(rows.len());
        for (id, name, cron_expr, template_json, created_at, last_run, next_run) in rows {
            match serde_json::from_str::<JobRequest>(&template_json) {
                Ok(template) => tasks.push(ScheduledTask {
                    id,
                    name,
                    cron_expr,
                    template,
                    created_at,
                    last_run,
                    next_run,
                }),
                Err(e) => warn!(schedule = %name, error = %e, "skipping schedule with unreadable template"),
            }
        }
        Ok(tasks)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct ScheduleEntry {
    task: ScheduledTask,
    /// Stops this schedule's fire loop.
    stop: CancellationToken,
}

struct SchedulerInner {
    store: ScheduleStore,
    executor: Executor,
    tasks: Mutex<HashMap<String, ScheduleEntry>>,
}

/// Owns the registered schedules and their fire loops.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(pool: Pool, executor: Executor) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store: ScheduleStore::new(pool),
                executor,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a new schedule.
    ///
    /// The cron expression and the template are validated before anything
    /// is stored; a rejected schedule leaves no trace.
    pub async fn create_schedule(
        &self,
        name: &str,
        cron_expr: &str,
        template: JobRequest,
    ) -> Result<ScheduledTask, ScheduleError> {
        let schedule = validate(cron_expr, &template, self.inner.executor.launcher().as_ref())?;

        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            cron_expr: cron_expr.trim().to_string(),
            template,
            created_at: Utc::now(),
            last_run: None,
            next_run: schedule.upcoming(Utc).next(),
        };

        let store = self.inner.store.clone();
        let row = task.clone();
        tokio::task::spawn_blocking(move || store.insert(&row)).await??;

        info!(schedule = %task.name, id = %task.id, cron = %task.cron_expr, "schedule created");
        self.register(task.clone(), schedule);
        Ok(task)
    }

    /// Registered schedules, oldest first.
    pub fn list_schedules(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        tasks
    }

    /// Remove a schedule. A fire already in progress completes, but the
    /// schedule never fires again.
    ///
    /// The row is deleted first; if that fails the schedule stays registered.
    pub async fn delete_schedule(&self, id: &str) -> Result<(), ScheduleError> {
        if !self.inner.tasks.lock().contains_key(id) {
            return Err(ScheduleError::NotFound(id.to_string()));
        }

        let store = self.inner.store.clone();
        let key = id.to_string();
        tokio::task::spawn_blocking(move || store.delete(&key)).await??;

        let Some(entry) = self.inner.tasks.lock().remove(id) else {
            return Err(ScheduleError::NotFound(id.to_string()));
        };
        entry.stop.cancel();
        info!(schedule = %entry.task.name, id, "schedule deleted");
        Ok(())
    }

    /// Re-register every persisted schedule. Called once at startup.
    pub async fn restore(&self) -> Result<usize, ScheduleError> {
        let store = self.inner.store.clone();
        let tasks = tokio::task::spawn_blocking(move || store.load_all()).await??;

        let mut restored = 0;
        for mut task in tasks {
            match parse_cron(&task.cron_expr) {
                Ok(schedule) => {
                    task.next_run = schedule.upcoming(Utc).next();
                    self.register(task, schedule);
                    restored += 1;
                }
                Err(e) => warn!(schedule = %task.name, error = %e, "skipping schedule"),
            }
        }
        info!(restored, "schedules restored");
        Ok(restored)
    }

    /// Upcoming fire times across all registered schedules.
    pub fn preview_next_runs(&self, hours: u64) -> Result<Vec<UpcomingRun>, ScheduleError> {
        preview(&self.list_schedules(), hours)
    }

    /// Stop every fire loop. Registered schedules stay in the database.
    pub fn shutdown(&self) {
        let tasks = self.inner.tasks.lock();
        for entry in tasks.values() {
            entry.stop.cancel();
        }
    }

    fn register(&self, task: ScheduledTask, schedule: CronSchedule) {
        let stop = CancellationToken::new();
        let id = task.id.clone();
        self.inner.tasks.lock().insert(
            id.clone(),
            ScheduleEntry {
                task,
                stop: stop.clone(),
            },
        );
        tokio::spawn(fire_loop(Arc::downgrade(&self.inner), id, schedule, stop));
    }
}

async fn fire_loop(
    inner: Weak<SchedulerInner>,
    id: String,
    schedule: CronSchedule,
    stop: CancellationToken,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            info!(id = %id, "schedule has no upcoming fire time");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let Some(inner) = inner.upgrade() else { return };
        fire(&inner, &id, &schedule).await;
    }
}

async fn fire(inner: &SchedulerInner, id: &str, schedule: &CronSchedule) {
    let found = inner
        .tasks
        .lock()
        .get(id)
        .map(|entry| (entry.task.name.clone(), entry.task.template.clone()));
    let Some((name, template)) = found else { return };

    match inner.executor.submit(&template).await {
        Ok(execution_id) => info!(schedule = %name, execution_id = %execution_id, "schedule fired"),
        Err(e) => error!(schedule = %name, error = %e, "scheduled submission failed"),
    }

    let now = Utc::now();
    let next = schedule.upcoming(Utc).next();
    {
        let mut tasks = inner.tasks.lock();
        match tasks.get_mut(id) {
            Some(entry) => {
                entry.task.last_run = Some(now);
                entry.task.next_run = next;
            }
            // Deleted while firing.
            None => return,
        }
    }

    let store = inner.store.clone();
    let key = id.to_string();
    match tokio::task::spawn_blocking(move || store.record_run(&key, now, next)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(schedule = %name, error = %e, "failed to record schedule run"),
        Err(e) => warn!(schedule = %name, error = %e, "schedule bookkeeping task failed"),
    }
}
