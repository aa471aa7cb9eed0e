//! Job requests and their translation into concrete commands.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ExecError;
use crate::model::{ExecutionMetadata, JobKind};
use crate::runner::CommandSpec;

/// A job submission. The `kind` tag selects the variant on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRequest {
    Playbook(PlaybookRequest),
    Adhoc(AdHocRequest),
    Command(CommandRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybookRequest {
    /// Playbook file, relative to the playbook directory.
    pub playbook: String,
    /// Inventory file, relative to the inventory directory.
    pub inventory: String,
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub skip_tags: Vec<String>,
    #[serde(default)]
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
    #[serde(default, rename = "become")]
    pub escalate: bool,
    #[serde(default)]
    pub become_user: Option<String>,
    #[serde(default)]
    pub forks: Option<u32>,
    #[serde(default)]
    pub verbosity: u8,
    #[serde(default)]
    pub check: bool,
    #[serde(default)]
    pub diff: bool,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub vault_password_file: Option<String>,
    /// Seconds. Zero or absent means the launcher default.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdHocRequest {
    /// Host pattern the module runs against.
    pub hosts: String,
    pub module: String,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub inventory: Option<String>,
    #[serde(default)]
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
    #[serde(default, rename = "become")]
    pub escalate: bool,
    #[serde(default)]
    pub become_user: Option<String>,
    #[serde(default)]
    pub forks: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl JobRequest {
    /// Shorthand for a raw command with an optional timeout in seconds.
    pub fn command<I, S>(argv: I, timeout: Option<u64>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        JobRequest::Command(CommandRequest {
            argv: argv.into_iter().map(Into::into).collect(),
            timeout,
            ..CommandRequest::default()
        })
    }
}

/// Everything the executor needs to start and record a job.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub kind: JobKind,
    pub job_name: Option<String>,
    pub target: Option<String>,
    pub command: CommandSpec,
    /// Request snapshot, present for batch runs only.
    pub metadata: Option<ExecutionMetadata>,
}

/// Turns a request into a launch plan, validating it on the way.
pub trait JobLauncher: Send + Sync {
    fn prepare(&self, request: &JobRequest) -> Result<LaunchPlan, ExecError>;
}

#[derive(Debug, Clone)]
pub struct AnsibleLauncher {
    playbook_dir: PathBuf,
    inventory_dir: PathBuf,
    playbook_bin: String,
    adhoc_bin: String,
    default_timeout: Option<Duration>,
}

impl AnsibleLauncher {
    /// Playbooks and inventories are resolved under `base_dir/playbooks`
    /// and `base_dir/inventory`.
    pub fn new(base_dir: &Path) -> Self {
        Self {
            playbook_dir: base_dir.join("playbooks"),
            inventory_dir: base_dir.join("inventory"),
            playbook_bin: "ansible-playbook".into(),
            adhoc_bin: "ansible".into(),
            default_timeout: None,
        }
    }

    pub fn with_binaries(mut self, playbook_bin: impl Into<String>, adhoc_bin: impl Into<String>) -> Self {
        self.playbook_bin = playbook_bin.into();
        self.adhoc_bin = adhoc_bin.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn timeout(&self, secs: Option<u64>) -> Option<Duration> {
        match secs {
            Some(s) if s > 0 => Some(Duration::from_secs(s)),
            _ => self.default_timeout,
        }
    }

    fn playbook(&self, req: &PlaybookRequest) -> Result<LaunchPlan, ExecError> {
        if req.playbook.trim().is_empty() {
            return Err(ExecError::InvalidRequest("playbook is required".into()));
        }
        if req.inventory.trim().is_empty() {
            return Err(ExecError::InvalidRequest("inventory is required".into()));
        }
        let playbook_path = resolve_under(&self.playbook_dir, &req.playbook)?;
        if !playbook_path.is_file() {
            return Err(ExecError::InvalidRequest(format!(
                "playbook not found: {}",
                req.playbook
            )));
        }
        let inventory_path = resolve_under(&self.inventory_dir, &req.inventory)?;

        let mut args = vec![
            playbook_path.display().to_string(),
            "-i".to_string(),
            inventory_path.display().to_string(),
        ];
        if let Some(limit) = req.limit.as_deref().filter(|l| !l.is_empty()) {
            args.extend(["--limit".to_string(), limit.to_string()]);
        }
        if !req.tags.is_empty() {
            args.extend(["--tags".to_string(), req.tags.join(",")]);
        }
        if !req.skip_tags.is_empty() {
            args.extend(["--skip-tags".to_string(), req.skip_tags.join(",")]);
        }
        push_common(
            &mut args,
            &req.extra_vars,
            req.escalate,
            req.become_user.as_deref(),
            req.forks,
        )?;
        if req.verbosity > 0 {
            args.push(format!("-{}", "v".repeat(usize::from(req.verbosity.min(6)))));
        }
        if req.check {
            args.push("--check".into());
        }
        if req.diff {
            args.push("--diff".into());
        }
        if let Some(file) = req.vault_password_file.as_deref().filter(|f| !f.is_empty()) {
            args.extend(["--vault-password-file".to_string(), file.to_string()]);
        }
        if let Some(key) = req.private_key.as_deref().filter(|k| !k.is_empty()) {
            args.extend(["--private-key".to_string(), key.to_string()]);
        }

        let timeout = self.timeout(req.timeout);
        let metadata = ExecutionMetadata {
            limit: req.limit.clone(),
            tags: req.tags.clone(),
            skip_tags: req.skip_tags.clone(),
            extra_vars: req.extra_vars.clone(),
            forks: req.forks,
            verbosity: req.verbosity,
            check_mode: req.check,
            diff_mode: req.diff,
            escalate: req.escalate,
            become_user: req.become_user.clone(),
            timeout_secs: timeout.map(|t| t.as_secs()),
        };

        Ok(LaunchPlan {
            kind: JobKind::BatchRun,
            job_name: Some(req.playbook.clone()),
            target: Some(req.inventory.clone()),
            command: CommandSpec {
                program: self.playbook_bin.clone(),
                args,
                env: ansible_env(),
                working_dir: None,
                timeout,
            },
            metadata: Some(metadata),
        })
    }

    fn adhoc(&self, req: &AdHocRequest) -> Result<LaunchPlan, ExecError> {
        if req.hosts.trim().is_empty() {
            return Err(ExecError::InvalidRequest("hosts is required".into()));
        }
        if req.module.trim().is_empty() {
            return Err(ExecError::InvalidRequest("module is required".into()));
        }

        let mut args = vec![req.hosts.clone()];
        if let Some(inventory) = req.inventory.as_deref().filter(|i| !i.is_empty()) {
            let path = resolve_under(&self.inventory_dir, inventory)?;
            args.extend(["-i".to_string(), path.display().to_string()]);
        }
        args.extend(["-m".to_string(), req.module.clone()]);
        if let Some(module_args) = req.args.as_deref().filter(|a| !a.is_empty()) {
            args.extend(["-a".to_string(), module_args.to_string()]);
        }
        push_common(
            &mut args,
            &req.extra_vars,
            req.escalate,
            req.become_user.as_deref(),
            req.forks,
        )?;

        Ok(LaunchPlan {
            kind: JobKind::SingleCommand,
            job_name: Some(req.module.clone()),
            target: Some(req.hosts.clone()),
            command: CommandSpec {
                program: self.adhoc_bin.clone(),
                args,
                env: ansible_env(),
                working_dir: None,
                timeout: self.timeout(req.timeout),
            },
            metadata: None,
        })
    }

    fn raw(&self, req: &CommandRequest) -> Result<LaunchPlan, ExecError> {
        let mut command = CommandSpec::from_argv(&req.argv)
            .filter(|spec| !spec.program.is_empty())
            .ok_or_else(|| ExecError::InvalidRequest("argv must not be empty".into()))?;
        command.env = req.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        command.working_dir = req.working_dir.clone();
        command.timeout = self.timeout(req.timeout);

        let job_name = Path::new(&command.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.program.clone());

        Ok(LaunchPlan {
            kind: JobKind::SingleCommand,
            job_name: Some(job_name),
            target: None,
            command,
            metadata: None,
        })
    }
}

impl JobLauncher for AnsibleLauncher {
    fn prepare(&self, request: &JobRequest) -> Result<LaunchPlan, ExecError> {
        match request {
            JobRequest::Playbook(req) => self.playbook(req),
            JobRequest::Adhoc(req) => self.adhoc(req),
            JobRequest::Command(req) => self.raw(req),
        }
    }
}

fn ansible_env() -> Vec<(String, String)> {
    vec![
        ("ANSIBLE_HOST_KEY_CHECKING".into(), "False".into()),
        ("ANSIBLE_RETRY_FILES_ENABLED".into(), "False".into()),
    ]
}

fn push_common(
    args: &mut Vec<String>,
    extra_vars: &serde_json::Map<String, serde_json::Value>,
    escalate: bool,
    become_user: Option<&str>,
    forks: Option<u32>,
) -> Result<(), ExecError> {
    if !extra_vars.is_empty() {
        let encoded = serde_json::to_string(extra_vars)
            .map_err(|e| ExecError::InvalidRequest(format!("extra_vars: {}", e)))?;
        args.extend(["--extra-vars".to_string(), encoded]);
    }
    if escalate {
        args.push("--become".into());
        if let Some(user) = become_user.filter(|u| !u.is_empty()) {
            args.extend(["--become-user".to_string(), user.to_string()]);
        }
    }
    if let Some(forks) = forks.filter(|f| *f > 0) {
        args.extend(["--forks".to_string(), forks.to_string()]);
    }
    Ok(())
}

/// Join a caller-supplied relative path onto `base`, refusing anything that
/// could escape it.
fn resolve_under(base: &Path, relative: &str) -> Result<PathBuf, ExecError> {
    let rel = Path::new(relative);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ExecError::InvalidRequest(format!(
            "path must stay inside {}: {}",
            base.display(),
            relative
        )));
    }
    Ok(base.join(rel))
}
