//! TOML configuration for the opsrunner daemon and CLI.
//!
//! Layered: an explicit path, then the `OPSRUNNER_CONFIG` environment
//! variable, then `/etc/opsrunner/opsrunner.toml`, then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::executor::{AnsibleLauncher, BrokerConfig, ExecutorConfig, JobLauncher};
use crate::retention::RetentionConfig;
use crate::runner::RunnerConfig;
use crate::storage::StoreConfig;

pub const CONFIG_ENV: &str = "OPSRUNNER_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/opsrunner/opsrunner.toml";

/// Longest gap between retention passes.
pub const MAX_RETENTION_INTERVAL_HOURS: u64 = 24 * 365;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpsrunnerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub retention: RetentionSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OpsrunnerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded opsrunner configuration");
        Ok(config)
    }

    /// An explicit path must load; otherwise fall back through the
    /// environment variable, the system location, and the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "OPSRUNNER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_cache_entries: self.storage.cache_max_entries,
            cache_freshness: i64::try_from(self.storage.cache_freshness_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            output_line_cap: self.storage.output_line_cap,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            log_dir: Some(self.executor.log_dir()),
            kill_grace: Duration::from_secs(self.executor.kill_grace_secs),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            broker: BrokerConfig {
                subscriber_capacity: self.executor.stream_buffer.max(1),
                ..BrokerConfig::default()
            },
            stream_grace: Duration::from_secs(self.executor.stream_grace_secs),
            drain_grace: Duration::from_secs(self.executor.drain_grace_secs),
            ..ExecutorConfig::default()
        }
    }

    pub fn launcher(&self) -> Arc<dyn JobLauncher> {
        let timeout = match self.executor.default_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Arc::new(
            AnsibleLauncher::new(&self.executor.base_dir)
                .with_binaries(
                    self.executor.ansible_playbook_bin.clone(),
                    self.executor.ansible_bin.clone(),
                )
                .with_default_timeout(timeout),
        )
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            retention_days: self.retention.days,
            interval: Duration::from_secs(
                self.retention.interval_hours.clamp(1, MAX_RETENTION_INTERVAL_HOURS) * 60 * 60,
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind address for `serve`.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub cache_max_entries: usize,
    pub cache_freshness_secs: u64,
    /// Most recent output lines kept per execution.
    pub output_line_cap: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/opsrunner.db"),
            cache_max_entries: 100,
            cache_freshness_secs: 3600,
            output_line_cap: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Holds `playbooks/`, `inventory/` and `logs/`.
    pub base_dir: PathBuf,
    pub ansible_playbook_bin: String,
    pub ansible_bin: String,
    /// Applied when a request carries no timeout. Zero disables it.
    pub default_timeout_secs: u64,
    /// Per-subscriber live stream buffer, in lines.
    pub stream_buffer: usize,
    pub stream_grace_secs: u64,
    pub kill_grace_secs: u64,
    pub drain_grace_secs: u64,
}

impl ExecutorSection {
    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data"),
            ansible_playbook_bin: "ansible-playbook".to_string(),
            ansible_bin: "ansible".to_string(),
            default_timeout_secs: 0,
            stream_buffer: 100,
            stream_grace_secs: 300,
            kill_grace_secs: 5,
            drain_grace_secs: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub days: u32,
    pub interval_hours: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            days: 30,
            interval_hours: 24,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
