//! Durable execution history fronted by a bounded in-memory cache.
//!
//! Reads check the cache first and fall back to rebuilding the record from
//! the execution row and its child tables. Writes go through one transaction
//! per save; the cache is only touched after commit.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::cache::ExecutionCache;
use super::{from_db_time, to_db_time, Pool, StoreError};
use crate::model::{ExecutionMetadata, ExecutionRecord, ExecutionStatus, HostStats, JobKind};

const EXECUTION_COLUMNS: &str =
    "id, kind, status, job_name, target, start_time, end_time, duration, exit_code, changed";

/// Tuning knobs for the store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on cached records after a prune pass.
    pub max_cache_entries: usize,
    /// Terminal records that ended within this window are preferred in cache.
    pub cache_freshness: Duration,
    /// Only the most recent lines of a record's output are persisted.
    pub output_line_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: 100,
            cache_freshness: Duration::hours(1),
            output_line_cap: 1000,
        }
    }
}

/// Query-time filters for [`ExecutionStore::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Filters {
    pub status: Option<ExecutionStatus>,
    pub kind: Option<JobKind>,
    pub target: Option<String>,
    pub job_name: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub only_failed: bool,
    pub only_changed: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Execution history: SQLite for durability, a small cache for hot records.
#[derive(Clone)]
pub struct ExecutionStore {
    pool: Pool,
    cache: Arc<Mutex<ExecutionCache>>,
    /// Serializes write transactions across the process.
    write_lock: Arc<Mutex<()>>,
    config: StoreConfig,
}

impl ExecutionStore {
    /// Build a store over `pool` and warm the cache with running and
    /// recently started executions.
    pub fn open(pool: Pool, config: StoreConfig) -> Result<Self, StoreError> {
        let cache = ExecutionCache::new(config.max_cache_entries, config.cache_freshness);
        let store = Self {
            pool,
            cache: Arc::new(Mutex::new(cache)),
            write_lock: Arc::new(Mutex::new(())),
            config,
        };
        let warmed = store.warm_cache()?;
        info!(warmed, "execution store ready");
        Ok(store)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of records currently held in memory.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Persist `record` atomically, then refresh its cache entry.
    ///
    /// `metadata` is written only when this call creates a running record;
    /// it is ignored on every later save.
    pub fn save(
        &self,
        record: &ExecutionRecord,
        metadata: Option<&ExecutionMetadata>,
    ) -> Result<(), StoreError> {
        record.validate().map_err(StoreError::InvalidRecord)?;

        {
            let _guard = self.write_lock.lock();
            let mut conn = self.pool.get()?;
            let tx = conn.transaction()?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    params![record.id],
                    |row| row.get(0),
                )
                .optional()?;

            let is_new = match existing {
                None => true,
                Some(raw) => {
                    let current = ExecutionStatus::from_str(&raw).map_err(StoreError::InvalidRecord)?;
                    if !current.can_become(record.status) {
                        return Err(StoreError::InvalidTransition {
                            id: record.id.clone(),
                            from: current,
                            to: record.status,
                        });
                    }
                    false
                }
            };

            upsert_execution(&tx, record)?;
            if is_new && record.status == ExecutionStatus::Running {
                if let Some(meta) = metadata {
                    insert_metadata(&tx, &record.id, meta)?;
                }
            }
            replace_output(&tx, record, self.config.output_line_cap)?;
            replace_host_stats(&tx, record)?;
            replace_failures(&tx, record)?;

            tx.commit()?;
        }

        let mut cache = self.cache.lock();
        cache.insert(record.clone());
        let evicted = cache.prune(Utc::now());
        if evicted > 0 {
            debug!(evicted, size = cache.len(), "pruned execution cache");
        }
        Ok(())
    }

    /// Fetch one execution, from cache when possible.
    pub fn get(&self, id: &str) -> Result<ExecutionRecord, StoreError> {
        let cached = self.cache.lock().get(id);
        if let Some(record) = cached {
            return Ok(record);
        }

        let conn = self.pool.get()?;
        let mut record = conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        load_children(&conn, &mut record)?;
        Ok(record)
    }

    /// Executions matching `filters`, newest first.
    pub fn list(&self, filters: &Filters) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut sql = format!("SELECT {} FROM executions WHERE 1=1", EXECUTION_COLUMNS);
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filters.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str()));
        }
        if let Some(kind) = filters.kind {
            sql.push_str(" AND kind = ?");
            args.push(Box::new(kind.as_str()));
        }
        if let Some(target) = &filters.target {
            sql.push_str(" AND target = ?");
            args.push(Box::new(target.clone()));
        }
        if let Some(job_name) = &filters.job_name {
            sql.push_str(" AND job_name = ?");
            args.push(Box::new(job_name.clone()));
        }
        if let Some(since) = &filters.since {
            sql.push_str(" AND start_time >= ?");
            args.push(Box::new(to_db_time(since)));
        }
        if let Some(until) = &filters.until {
            sql.push_str(" AND start_time <= ?");
            args.push(Box::new(to_db_time(until)));
        }
        if filters.only_failed {
            sql.push_str(" AND status = 'failed'");
        }
        if filters.only_changed {
            sql.push_str(" AND changed = 1");
        }

        sql.push_str(" ORDER BY start_time DESC");

        match (filters.limit, filters.offset) {
            (Some(limit), offset) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                args.push(Box::new(limit as i64));
                args.push(Box::new(offset.unwrap_or(0) as i64));
            }
            (None, Some(offset)) => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                args.push(Box::new(offset as i64));
            }
            (None, None) => {}
        }

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for mut record in rows {
            let cached = self.cache.lock().get(&record.id);
            match cached {
                Some(hit) => records.push(hit),
                None => {
                    load_children(&conn, &mut record)?;
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// The request snapshot written at submission, if this was a batch run.
    pub fn metadata(&self, id: &str) -> Result<Option<ExecutionMetadata>, StoreError> {
        let conn = self.pool.get()?;
        let raw = conn
            .query_row(
                "SELECT limit_hosts, tags, skip_tags, extra_vars, forks, verbosity,
                        check_mode, diff_mode, become, become_user, timeout
                 FROM execution_metadata WHERE execution_id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<u32>>(4)?,
                        row.get::<_, u8>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, bool>(7)?,
                        row.get::<_, bool>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<i64>>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((limit, tags, skip_tags, extra_vars, forks, verbosity, check, diff, escalate, become_user, timeout)) =
            raw
        else {
            return Ok(None);
        };

        Ok(Some(ExecutionMetadata {
            limit,
            tags: serde_json::from_str(&tags)?,
            skip_tags: serde_json::from_str(&skip_tags)?,
            extra_vars: serde_json::from_str(&extra_vars)?,
            forks,
            verbosity,
            check_mode: check,
            diff_mode: diff,
            escalate,
            become_user,
            timeout_secs: timeout.map(|t| t.max(0) as u64),
        }))
    }

    /// Delete terminal executions started more than `retention_days` ago.
    ///
    /// Running executions are never deleted, whatever their age. Child rows
    /// go with their parent via `ON DELETE CASCADE`. Returns the number of
    /// executions removed. A retention reaching past the earliest
    /// representable time deletes nothing.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = Duration::try_days(i64::from(retention_days))
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            debug!(retention_days, "retention window predates any record");
            return Ok(0);
        };

        let deleted = {
            let _guard = self.write_lock.lock();
            let conn = self.pool.get()?;
            let deleted = conn.execute(
                "DELETE FROM executions WHERE start_time <= ?1 AND status != 'running'",
                params![to_db_time(&cutoff)],
            )?;
            if deleted > 0 {
                // Reclaim the pages freed by the delete.
                conn.execute_batch("VACUUM")?;
            }
            deleted
        };

        if deleted > 0 {
            let evicted = self.cache.lock().evict_started_before(cutoff);
            info!(deleted, evicted, retention_days, "removed expired executions");
        }
        Ok(deleted)
    }

    /// Let SQLite refresh its query planner statistics.
    pub fn optimize(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }

    /// On-disk size of the database in bytes.
    pub fn database_size(&self) -> Result<i64, StoreError> {
        let conn = self.pool.get()?;
        let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(pages * page_size)
    }

    fn warm_cache(&self) -> Result<usize, StoreError> {
        let since = Utc::now() - Duration::hours(1);
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM executions
             WHERE status = 'running' OR start_time >= ?1
             ORDER BY start_time DESC
             LIMIT ?2",
            EXECUTION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![to_db_time(&since), self.config.max_cache_entries as i64],
                row_to_record,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut loaded = Vec::with_capacity(rows.len());
        for mut record in rows {
            load_children(&conn, &mut record)?;
            loaded.push(record);
        }

        let count = loaded.len();
        let mut cache = self.cache.lock();
        for record in loaded {
            cache.insert(record);
        }
        Ok(count)
    }
}

fn upsert_execution(tx: &Transaction<'_>, record: &ExecutionRecord) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO executions (
            id, kind, status, job_name, target,
            start_time, end_time, duration, exit_code, changed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            end_time = excluded.end_time,
            duration = excluded.duration,
            exit_code = excluded.exit_code,
            changed = excluded.changed,
            updated_at = datetime('now')",
        params![
            record.id,
            record.kind.as_str(),
            record.status.as_str(),
            record.job_name,
            record.target,
            to_db_time(&record.start_time),
            record.end_time.as_ref().map(to_db_time),
            record.duration,
            record.exit_code,
            record.changed,
        ],
    )?;
    Ok(())
}

fn insert_metadata(
    tx: &Transaction<'_>,
    id: &str,
    meta: &ExecutionMetadata,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR IGNORE INTO execution_metadata (
            execution_id, limit_hosts, tags, skip_tags, extra_vars, forks,
            verbosity, check_mode, diff_mode, become, become_user, timeout
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id,
            meta.limit,
            serde_json::to_string(&meta.tags)?,
            serde_json::to_string(&meta.skip_tags)?,
            serde_json::to_string(&meta.extra_vars)?,
            meta.forks,
            meta.verbosity,
            meta.check_mode,
            meta.diff_mode,
            meta.escalate,
            meta.become_user,
            meta.timeout_secs.map(|t| t as i64),
        ],
    )?;
    Ok(())
}

fn replace_output(tx: &Transaction<'_>, record: &ExecutionRecord, cap: usize) -> rusqlite::Result<()> {
    tx.execute(
        "DELETE FROM execution_output WHERE execution_id = ?1",
        params![record.id],
    )?;
    let start = record.output.len().saturating_sub(cap);
    let mut stmt = tx.prepare(
        "INSERT INTO execution_output (execution_id, line_number, content) VALUES (?1, ?2, ?3)",
    )?;
    for (offset, line) in record.output[start..].iter().enumerate() {
        stmt.execute(params![record.id, (start + offset) as i64, line])?;
    }
    Ok(())
}

fn replace_host_stats(tx: &Transaction<'_>, record: &ExecutionRecord) -> rusqlite::Result<()> {
    tx.execute(
        "DELETE FROM execution_stats WHERE execution_id = ?1",
        params![record.id],
    )?;
    let mut stmt = tx.prepare(
        "INSERT INTO execution_stats (
            execution_id, host, ok, changed, unreachable, failed, skipped, rescued, ignored
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for (host, s) in &record.per_host_stats {
        stmt.execute(params![
            record.id,
            host,
            s.ok,
            s.changed,
            s.unreachable,
            s.failed,
            s.skipped,
            s.rescued,
            s.ignored
        ])?;
    }
    Ok(())
}

fn replace_failures(tx: &Transaction<'_>, record: &ExecutionRecord) -> rusqlite::Result<()> {
    tx.execute(
        "DELETE FROM execution_failures WHERE execution_id = ?1",
        params![record.id],
    )?;
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO execution_failures (execution_id, host, failure_type) VALUES (?1, ?2, ?3)",
    )?;
    for host in &record.failed_hosts {
        stmt.execute(params![record.id, host, "failed"])?;
    }
    for host in &record.unreachable_hosts {
        stmt.execute(params![record.id, host, "unreachable"])?;
    }
    Ok(())
}

fn parse_column<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    T::from_str(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let kind: String = row.get(1)?;
    let status: String = row.get(2)?;
    let start: String = row.get(5)?;
    let end: Option<String> = row.get(6)?;

    let mut record = ExecutionRecord::started(row.get::<_, String>(0)?, parse_column(1, &kind)?);
    record.status = parse_column(2, &status)?;
    record.job_name = row.get(3)?;
    record.target = row.get(4)?;
    record.start_time = from_db_time(5, &start)?;
    record.end_time = end.as_deref().map(|raw| from_db_time(6, raw)).transpose()?;
    record.duration = row.get(7)?;
    record.exit_code = row.get(8)?;
    record.changed = row.get(9)?;
    Ok(record)
}

fn load_children(conn: &Connection, record: &mut ExecutionRecord) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT content FROM execution_output WHERE execution_id = ?1 ORDER BY line_number",
    )?;
    record.output = stmt
        .query_map(params![record.id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT host, ok, changed, unreachable, failed, skipped, rescued, ignored
         FROM execution_stats WHERE execution_id = ?1",
    )?;
    let stats = stmt.query_map(params![record.id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            HostStats {
                ok: row.get(1)?,
                changed: row.get(2)?,
                unreachable: row.get(3)?,
                failed: row.get(4)?,
                skipped: row.get(5)?,
                rescued: row.get(6)?,
                ignored: row.get(7)?,
            },
        ))
    })?;
    record.per_host_stats = stats.collect::<Result<_, _>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT host, failure_type FROM execution_failures
         WHERE execution_id = ?1 ORDER BY host",
    )?;
    let failures = stmt
        .query_map(params![record.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    record.failed_hosts.clear();
    record.unreachable_hosts.clear();
    for (host, kind) in failures {
        match kind.as_str() {
            "failed" => record.failed_hosts.push(host),
            "unreachable" => record.unreachable_hosts.push(host),
            _ => {}
        }
    }
    Ok(())
}
