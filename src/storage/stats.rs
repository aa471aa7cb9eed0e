//! Aggregate execution statistics over a trailing window.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{to_db_time, ExecutionStore, StoreError};

/// Number of rows in each top-N breakdown.
const TOP_N: i64 = 10;

/// Named trailing windows accepted by the API and CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsPeriod {
    Hour,
    #[default]
    Day,
    Week,
    Month,
}

impl StatsPeriod {
    pub fn window(&self) -> Duration {
        match self {
            StatsPeriod::Hour => Duration::hours(1),
            StatsPeriod::Day => Duration::days(1),
            StatsPeriod::Week => Duration::weeks(1),
            StatsPeriod::Month => Duration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatsPeriod::Hour => "hour",
            StatsPeriod::Day => "day",
            StatsPeriod::Week => "week",
            StatsPeriod::Month => "month",
        }
    }
}

impl fmt::Display for StatsPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatsPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(StatsPeriod::Hour),
            "day" => Ok(StatsPeriod::Day),
            "week" => Ok(StatsPeriod::Week),
            "month" => Ok(StatsPeriod::Month),
            other => Err(format!(
                "unknown period '{}' (expected hour, day, week or month)",
                other
            )),
        }
    }
}

/// One row of a grouped count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    pub name: String,
    pub count: u64,
}

/// Computed on demand; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub since: DateTime<Utc>,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub running: u64,
    pub cancelled: u64,
    /// `success / total * 100`, or 0 for an empty window.
    pub success_rate: f64,
    /// Duration aggregates ignore records with no positive duration.
    pub avg_duration: Option<f64>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub top_failed_hosts: Vec<CountEntry>,
    pub top_jobs: Vec<CountEntry>,
}

impl ExecutionStore {
    /// Aggregate executions started within the last `window`.
    pub fn statistics(&self, window: Duration) -> Result<Statistics, StoreError> {
        let since = Utc::now() - window;
        let since_raw = to_db_time(&since);
        let conn = self.pool().get()?;

        let (total, success, failed, running, cancelled, avg, min, max) = conn.query_row(
            "SELECT
                COUNT(*),
                COUNT(CASE WHEN status = 'success' THEN 1 END),
                COUNT(CASE WHEN status = 'failed' THEN 1 END),
                COUNT(CASE WHEN status = 'running' THEN 1 END),
                COUNT(CASE WHEN status = 'cancelled' THEN 1 END),
                AVG(CASE WHEN duration > 0 THEN duration END),
                MIN(CASE WHEN duration > 0 THEN duration END),
                MAX(CASE WHEN duration > 0 THEN duration END)
             FROM executions
             WHERE start_time >= ?1",
            params![since_raw],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, Option<f64>>(7)?,
                ))
            },
        )?;

        let top_failed_hosts = grouped_counts(
            &conn,
            "SELECT f.host, COUNT(*) AS n
             FROM execution_failures f
             JOIN executions e ON e.id = f.execution_id
             WHERE f.failure_type = 'failed' AND e.start_time >= ?1
             GROUP BY f.host
             ORDER BY n DESC, f.host
             LIMIT ?2",
            &since_raw,
        )?;

        let top_jobs = grouped_counts(
            &conn,
            "SELECT job_name, COUNT(*) AS n
             FROM executions
             WHERE job_name IS NOT NULL AND start_time >= ?1
             GROUP BY job_name
             ORDER BY n DESC, job_name
             LIMIT ?2",
            &since_raw,
        )?;

        Ok(Statistics {
            since,
            total: total as u64,
            success: success as u64,
            failed: failed as u64,
            running: running as u64,
            cancelled: cancelled as u64,
            success_rate: success_rate(success, total),
            avg_duration: avg,
            min_duration: min,
            max_duration: max,
            top_failed_hosts,
            top_jobs,
        })
    }
}

fn success_rate(success: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        success as f64 / total as f64 * 100.0
    }
}

fn grouped_counts(
    conn: &rusqlite::Connection,
    sql: &str,
    since: &str,
) -> rusqlite::Result<Vec<CountEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![since, TOP_N], |row| {
        Ok(CountEntry {
            name: row.get(0)?,
            count: row.get::<_, i64>(1)? as u64,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionRecord, ExecutionStatus, JobKind};
    use crate::storage::{open_pool, StoreConfig};
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> ExecutionStore {
        let pool = open_pool(dir.path().join("stats.db").to_str().unwrap()).unwrap();
        ExecutionStore::open(pool, StoreConfig::default()).unwrap()
    }

    fn record(id: &str, job: &str, status: ExecutionStatus, secs: i64) -> ExecutionRecord {
        let mut rec = ExecutionRecord::started(id, JobKind::BatchRun);
        rec.job_name = Some(job.into());
        rec.start_time = rec.start_time - Duration::minutes(10);
        let end = rec.start_time + Duration::seconds(secs);
        rec.finish(status, if status == ExecutionStatus::Success { 0 } else { 2 }, end);
        rec
    }

    #[test]
    fn test_success_rate_seventy_percent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 0..7 {
            store
                .save(&record(&format!("ok{}", i), "site.yml", ExecutionStatus::Success, 4), None)
                .unwrap();
        }
        for i in 0..3 {
            let mut rec = record(&format!("bad{}", i), "db.yml", ExecutionStatus::Failed, 2);
            rec.failed_hosts = vec!["db1".into()];
            if i == 0 {
                rec.failed_hosts.push("db2".into());
            }
            store.save(&rec, None).unwrap();
        }

        let stats = store.statistics(StatsPeriod::Day.window()).unwrap();
        assert_eq!(stats.total, 10);
        assert_eq!(stats.success, 7);
        assert_eq!(stats.failed, 3);
        assert!((stats.success_rate - 70.0).abs() < 1e-9);
        assert_eq!(stats.min_duration, Some(2.0));
        assert_eq!(stats.max_duration, Some(4.0));
        assert_eq!(
            stats.top_failed_hosts,
            vec![
                CountEntry { name: "db1".into(), count: 3 },
                CountEntry { name: "db2".into(), count: 1 },
            ]
        );
        assert_eq!(stats.top_jobs[0], CountEntry { name: "site.yml".into(), count: 7 });
    }

    #[test]
    fn test_empty_window_has_zero_rate() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let stats = store.statistics(StatsPeriod::Hour.window()).unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.avg_duration, None);
        assert!(stats.top_jobs.is_empty());
    }

    #[test]
    fn test_window_excludes_older_records() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut old = record("old", "site.yml", ExecutionStatus::Success, 1);
        old.start_time = old.start_time - Duration::days(3);
        old.end_time = Some(old.start_time + Duration::seconds(1));
        store.save(&old, None).unwrap();
        store
            .save(&record("new", "site.yml", ExecutionStatus::Cancelled, 0), None)
            .unwrap();

        let stats = store.statistics(StatsPeriod::Day.window()).unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.cancelled, 1);
        // Zero-length runs do not count toward duration aggregates.
        assert_eq!(stats.avg_duration, None);
    }

    #[test]
    fn test_period_parse() {
        assert_eq!("week".parse::<StatsPeriod>().unwrap(), StatsPeriod::Week);
        assert_eq!(StatsPeriod::default(), StatsPeriod::Day);
        assert!("year".parse::<StatsPeriod>().is_err());
    }
}
