//! Background retention: periodic cleanup and store optimization.

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::storage::ExecutionStore;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Terminal executions older than this many days are deleted.
    pub retention_days: u32,
    /// Time between passes. The first pass runs one interval after start.
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub struct RetentionJanitor {
    store: ExecutionStore,
    config: RetentionConfig,
}

impl RetentionJanitor {
    pub fn new(store: ExecutionStore, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    /// One cleanup plus optimize pass. Failures are logged, never returned.
    pub async fn run_once(&self) {
        let store = self.store.clone();
        let days = self.config.retention_days;
        match tokio::task::spawn_blocking(move || store.cleanup(days)).await {
            Ok(Ok(deleted)) => info!(deleted, retention_days = days, "retention pass complete"),
            Ok(Err(e)) => error!(error = %e, "retention cleanup failed"),
            Err(e) => error!(error = %e, "retention cleanup task failed"),
        }

        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.optimize()).await {
            Ok(Ok(())) => debug!("store optimized"),
            Ok(Err(e)) => error!(error = %e, "store optimize failed"),
            Err(e) => error!(error = %e, "store optimize task failed"),
        }
    }

    /// Run passes on the configured interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            retention_days = self.config.retention_days,
            interval_sec = self.config.interval.as_secs(),
            "retention janitor started"
        );
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.run_once().await,
            }
        }
        info!("retention janitor stopped");
    }
}
