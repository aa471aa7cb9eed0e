//! Database schema and migrations.
//!
//! Migrations are applied in ascending version order, each inside its own
//! transaction, and recorded in `schema_version` so re-runs are no-ops.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::info;

/// One versioned schema change.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Every migration this build knows about, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "execution history tables",
        sql: "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                job_name TEXT,
                target TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration REAL NOT NULL DEFAULT 0,
                exit_code INTEGER NOT NULL DEFAULT 0,
                changed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_executions_start_time ON executions(start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_executions_kind ON executions(kind);
            CREATE INDEX IF NOT EXISTS idx_executions_job_name ON executions(job_name);

            CREATE TABLE IF NOT EXISTS execution_output (
                execution_id TEXT NOT NULL,
                line_number INTEGER NOT NULL,
                content TEXT NOT NULL,
                PRIMARY KEY (execution_id, line_number),
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS execution_stats (
                execution_id TEXT NOT NULL,
                host TEXT NOT NULL,
                ok INTEGER NOT NULL DEFAULT 0,
                changed INTEGER NOT NULL DEFAULT 0,
                unreachable INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                rescued INTEGER NOT NULL DEFAULT 0,
                ignored INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (execution_id, host),
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS execution_metadata (
                execution_id TEXT PRIMARY KEY,
                limit_hosts TEXT,
                tags TEXT NOT NULL,
                skip_tags TEXT NOT NULL,
                extra_vars TEXT NOT NULL,
                forks INTEGER,
                verbosity INTEGER NOT NULL DEFAULT 0,
                check_mode INTEGER NOT NULL DEFAULT 0,
                diff_mode INTEGER NOT NULL DEFAULT 0,
                become INTEGER NOT NULL DEFAULT 0,
                become_user TEXT,
                timeout INTEGER,
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS execution_failures (
                execution_id TEXT NOT NULL,
                host TEXT NOT NULL,
                failure_type TEXT NOT NULL CHECK (failure_type IN ('failed', 'unreachable')),
                PRIMARY KEY (execution_id, host, failure_type),
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );",
    },
    Migration {
        version: 2,
        description: "cron schedules",
        sql: "CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                cron_expr TEXT NOT NULL,
                template_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_run_at TEXT,
                next_run_at TEXT
            );",
    },
];

/// Run all pending migrations.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .with_context(|| format!("migration {} failed", migration.version))?;
        tx.execute(
            "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
            params![migration.version, migration.description],
        )?;
        tx.commit()?;
        info!(
            version = migration.version,
            description = migration.description,
            "applied schema migration"
        );
    }

    Ok(())
}
