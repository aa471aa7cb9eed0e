//! opsrunner -- asynchronous execution and tracking of automation jobs.
//!
//! This crate launches external tools as child processes, streams their
//! output, records every run in SQLite, fires jobs on cron schedules, and
//! expires old history.

pub mod api;
pub mod config;
pub mod executor;
pub mod model;
pub mod retention;
pub mod runner;
pub mod scheduler;
pub mod storage;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::OpsrunnerConfig;
use crate::executor::Executor;
use crate::retention::RetentionJanitor;
use crate::runner::ProcessRunner;
use crate::scheduler::Scheduler;
use crate::storage::ExecutionStore;

/// Open the database and the execution store described by `config`.
pub fn open_store(config: &OpsrunnerConfig) -> Result<ExecutionStore> {
    let db_path = config.storage.db_path.to_string_lossy();
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&db_path)?;
    let store = ExecutionStore::open(pool, config.store_config())
        .context("failed to open execution store")?;
    Ok(store)
}

/// Build an executor over `store` with the configured runner and launcher.
pub fn build_executor(config: &OpsrunnerConfig, store: ExecutionStore) -> Executor {
    Executor::new(
        store,
        ProcessRunner::new(config.runner_config()),
        config.launcher(),
        config.executor_config(),
    )
}

/// Start the opsrunner daemon: API server, scheduler, and retention janitor.
pub async fn serve(config: OpsrunnerConfig) -> Result<()> {
    // 1. Storage and executor
    let store = open_store(&config)?;
    let executor = build_executor(&config, store.clone());
    match executor.recover_orphans().await {
        Ok(0) => {}
        Ok(recovered) => warn!(recovered, "marked interrupted executions as failed"),
        Err(e) => warn!(error = %e, "orphan recovery failed"),
    }

    // 2. Scheduler
    let scheduler = Scheduler::new(store.pool().clone(), executor.clone());
    scheduler
        .restore()
        .await
        .context("failed to restore schedules")?;

    // 3. Retention janitor (background task)
    let shutdown = CancellationToken::new();
    let janitor = RetentionJanitor::new(store.clone(), config.retention_config());
    let janitor_handle = tokio::spawn(janitor.run(shutdown.child_token()));

    // 4. API server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    let app = api::router(api::state::AppState {
        executor: executor.clone(),
        scheduler: scheduler.clone(),
    });

    info!(%addr, "opsrunner listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 5. Drain
    info!("shutting down");
    scheduler.shutdown();
    shutdown.cancel();
    executor.shutdown().await;
    if let Err(e) = janitor_handle.await {
        warn!(error = %e, "retention janitor task failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
