//! Per-host recap extraction from captured job output.
//!
//! A recap line names a host followed by `key=value` counters, e.g.
//!
//! ```text
//! web1 : ok=3 changed=1 unreachable=0 failed=0 skipped=2 rescued=0 ignored=0
//! ```
//!
//! Only lines containing both `ok=` and `changed=` are considered.

use std::collections::BTreeMap;

use crate::model::{ExecutionRecord, HostStats};

/// Everything the extractor learns from one output.
#[derive(Debug, Default, PartialEq)]
pub struct RecapSummary {
    pub per_host: BTreeMap<String, HostStats>,
    pub changed: bool,
    pub failed_hosts: Vec<String>,
    pub unreachable_hosts: Vec<String>,
}

impl RecapSummary {
    /// Copy the extracted fields onto `record`.
    pub fn apply(self, record: &mut ExecutionRecord) {
        record.per_host_stats = self.per_host;
        record.changed = self.changed;
        record.failed_hosts = self.failed_hosts;
        record.unreachable_hosts = self.unreachable_hosts;
    }
}

pub fn extract<S: AsRef<str>>(lines: &[S]) -> RecapSummary {
    let mut summary = RecapSummary::default();

    for line in lines {
        let line = line.as_ref();
        if !(line.contains("ok=") && line.contains("changed=")) {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else { continue };
        let host = first.trim_end_matches(':');
        if host.is_empty() {
            continue;
        }

        let mut stats = HostStats::default();
        for field in fields {
            let Some((key, raw)) = field.split_once('=') else {
                continue;
            };
            let Some(value) = leading_number(raw) else {
                continue;
            };
            stats.set(key, value);
        }

        if stats.changed > 0 {
            summary.changed = true;
        }
        if stats.failed > 0 && !summary.failed_hosts.iter().any(|h| h == host) {
            summary.failed_hosts.push(host.to_string());
        }
        if stats.unreachable > 0 && !summary.unreachable_hosts.iter().any(|h| h == host) {
            summary.unreachable_hosts.push(host.to_string());
        }
        summary.per_host.insert(host.to_string(), stats);
    }

    summary
}

fn leading_number(raw: &str) -> Option<u32> {
    let end = raw
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(raw.len(), |(i, _)| i);
    raw[..end].parse().ok()
}
