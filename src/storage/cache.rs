//! Bounded cache of hot execution records.
//!
//! Holds copies only. Readers get clones, never a reference into the map.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::model::ExecutionRecord;

#[derive(Debug)]
pub struct ExecutionCache {
    entries: HashMap<String, ExecutionRecord>,
    max_entries: usize,
    freshness: Duration,
}

impl ExecutionCache {
    pub fn new(max_entries: usize, freshness: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            freshness,
        }
    }

    pub fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.entries.get(id).cloned()
    }

    /// Store a copy of `record`. A terminal entry is never replaced by a
    /// non-terminal snapshot of the same execution.
    pub fn insert(&mut self, record: ExecutionRecord) {
        if let Some(current) = self.entries.get(&record.id) {
            if current.status.is_terminal() && !record.status.is_terminal() {
                return;
            }
        }
        self.entries.insert(record.id.clone(), record);
    }

    pub fn remove(&mut self, id: &str) -> Option<ExecutionRecord> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Drop terminal entries whose start is older than `cutoff`.
    pub fn evict_started_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, rec| !rec.status.is_terminal() || rec.start_time >= cutoff);
        before - self.entries.len()
    }

    /// Bring the cache back under its size limit.
    ///
    /// Terminal entries that ended before the freshness window go first. If
    /// that is not enough, terminal entries are dropped oldest-ended first, and
    /// running entries only as a last resort (oldest start first). Everything
    /// evicted is still readable from the durable store.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        if self.entries.len() <= self.max_entries {
            return 0;
        }
        let before = self.entries.len();

        if let Some(cutoff) = now.checked_sub_signed(self.freshness) {
            self.entries.retain(|_, rec| match rec.end_time {
                Some(end) if rec.status.is_terminal() => end >= cutoff,
                _ => true,
            });
        }

        if self.entries.len() > self.max_entries {
            let mut ranked: Vec<(bool, DateTime<Utc>, String)> = self
                .entries
                .values()
                .map(|rec| {
                    let running = !rec.status.is_terminal();
                    let age_key = if running {
                        rec.start_time
                    } else {
                        rec.end_time.unwrap_or(rec.start_time)
                    };
                    (running, age_key, rec.id.clone())
                })
                .collect();
            // Terminal before running, then oldest first.
            ranked.sort();
            let excess = self.entries.len() - self.max_entries;
            for (_, _, id) in ranked.into_iter().take(excess) {
                self.entries.remove(&id);
            }
        }

        before - self.entries.len()
    }
}
