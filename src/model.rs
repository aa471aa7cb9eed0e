//! Execution records, per-host counters, and the request snapshot kept for batch runs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Shape of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A structured run against a declared target set (a playbook).
    BatchRun,
    /// A one-off command (ad-hoc module call or raw argv).
    SingleCommand,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::BatchRun => "batch_run",
            JobKind::SingleCommand => "single_command",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch_run" => Ok(JobKind::BatchRun),
            "single_command" => Ok(JobKind::SingleCommand),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

/// Lifecycle state of an execution.
///
/// `Running` is the only initial state. The other three are terminal and an
/// execution reaches exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    /// Whether a record currently in `self` may be saved as `next`.
    ///
    /// Re-saving the same status is allowed so a finalization retry is harmless.
    pub fn can_become(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Running => true,
            terminal => *terminal == next,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Outcome counters reported for one host in a run recap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    pub ok: u32,
    pub changed: u32,
    pub unreachable: u32,
    pub failed: u32,
    pub skipped: u32,
    pub rescued: u32,
    pub ignored: u32,
}

impl HostStats {
    /// Set a counter by its recap key. Unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: u32) -> bool {
        let slot = match key {
            "ok" => &mut self.ok,
            "changed" => &mut self.changed,
            "unreachable" => &mut self.unreachable,
            "failed" => &mut self.failed,
            "skipped" => &mut self.skipped,
            "rescued" => &mut self.rescued,
            "ignored" => &mut self.ignored,
            _ => return false,
        };
        *slot = value;
        true
    }
}

/// One run of an external job, tracked from submission to its terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub kind: JobKind,
    pub status: ExecutionStatus,
    /// Playbook, module, or program name. Used for "most run jobs".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    /// Host/group expression the job acts on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between `start_time` and `end_time`; zero while running.
    pub duration: f64,
    pub exit_code: i32,
    pub output: Vec<String>,
    pub changed: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_host_stats: BTreeMap<String, HostStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unreachable_hosts: Vec<String>,
}

impl ExecutionRecord {
    /// A fresh `running` record stamped with the current time.
    pub fn started(id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            kind,
            status: ExecutionStatus::Running,
            job_name: None,
            target: None,
            start_time: Utc::now().trunc_subsecs(3),
            end_time: None,
            duration: 0.0,
            exit_code: 0,
            output: Vec::new(),
            changed: false,
            per_host_stats: BTreeMap::new(),
            failed_hosts: Vec::new(),
            unreachable_hosts: Vec::new(),
        }
    }

    /// Move to a terminal status, stamping `end_time` and `duration`.
    ///
    /// Timestamps carry millisecond precision so they survive storage unchanged.
    pub fn finish(&mut self, status: ExecutionStatus, exit_code: i32, at: DateTime<Utc>) {
        let end = at.trunc_subsecs(3).max(self.start_time);
        self.status = status;
        self.exit_code = exit_code;
        self.end_time = Some(end);
        self.duration = (end - self.start_time).num_milliseconds() as f64 / 1000.0;
    }

    /// `end_time` must be present exactly when the status is terminal.
    pub fn validate(&self) -> Result<(), String> {
        match (self.status.is_terminal(), self.end_time) {
            (true, None) => Err(format!("{} record {} has no end_time", self.status, self.id)),
            (false, Some(_)) => Err(format!("running record {} has an end_time", self.id)),
            (true, Some(end)) if end < self.start_time => {
                Err(format!("record {} ends before it starts", self.id))
            }
            _ => Ok(()),
        }
    }
}

/// Request parameters captured for batch runs at submission time.
///
/// Written once alongside the first save and never updated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub skip_tags: Vec<String>,
    #[serde(default)]
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub forks: Option<u32>,
    #[serde(default)]
    pub verbosity: u8,
    #[serde(default)]
    pub check_mode: bool,
    #[serde(default)]
    pub diff_mode: bool,
    #[serde(default, rename = "become")]
    pub escalate: bool,
    #[serde(default)]
    pub become_user: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_finish_sets_end_time_and_duration() {
        let mut rec = ExecutionRecord::started("a", JobKind::SingleCommand);
        let end = rec.start_time + Duration::milliseconds(2500);
        rec.finish(ExecutionStatus::Success, 0, end);

        assert_eq!(rec.end_time, Some(end));
        assert!((rec.duration - 2.5).abs() < 1e-9);
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn test_finish_clamps_end_before_start() {
        let mut rec = ExecutionRecord::started("b", JobKind::SingleCommand);
        let before = rec.start_time - Duration::seconds(5);
        rec.finish(ExecutionStatus::Failed, 1, before);
        assert_eq!(rec.end_time, Some(rec.start_time));
        assert_eq!(rec.duration, 0.0);
    }

    #[test]
    fn test_validate_rejects_terminal_without_end() {
        let mut rec = ExecutionRecord::started("c", JobKind::BatchRun);
        rec.status = ExecutionStatus::Failed;
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        assert!(ExecutionStatus::Running.can_become(ExecutionStatus::Cancelled));
        assert!(ExecutionStatus::Success.can_become(ExecutionStatus::Success));
        assert!(!ExecutionStatus::Success.can_become(ExecutionStatus::Failed));
        assert!(!ExecutionStatus::Cancelled.can_become(ExecutionStatus::Running));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for s in ["running", "success", "failed", "cancelled"] {
            assert_eq!(s.parse::<ExecutionStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_host_stats_ignores_unknown_keys() {
        let mut stats = HostStats::default();
        assert!(stats.set("changed", 3));
        assert!(!stats.set("bogus", 9));
        assert_eq!(stats.changed, 3);
    }
}
