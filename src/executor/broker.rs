//! Per-execution live output fan-out.
//!
//! The broker keeps a bounded backlog so late subscribers can catch up, and
//! pushes each new line to every live subscriber through its own bounded
//! channel. A subscriber that stops draining for longer than the send
//! timeout is dropped; it can never stall output capture for good.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::ExecutionRecord;

/// What a live subscriber receives.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// One output line, stdout or stderr.
    Line(String),
    /// The final record. Always the last event on a channel.
    Completed(Box<ExecutionRecord>),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Per-subscriber channel capacity on top of the replayed backlog.
    pub subscriber_capacity: usize,
    /// Lines kept for replay to late subscribers.
    pub backlog_lines: usize,
    /// How long a publish waits on one full subscriber before dropping it.
    pub send_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 100,
            backlog_lines: 500,
            send_timeout: Duration::from_secs(2),
        }
    }
}

struct BrokerState {
    backlog: VecDeque<String>,
    subscribers: Vec<mpsc::Sender<OutputEvent>>,
    completed: Option<Box<ExecutionRecord>>,
}

pub struct OutputBroker {
    execution_id: String,
    config: BrokerConfig,
    state: Mutex<BrokerState>,
}

impl OutputBroker {
    pub fn new(execution_id: impl Into<String>, config: BrokerConfig) -> Self {
        Self {
            execution_id: execution_id.into(),
            state: Mutex::new(BrokerState {
                backlog: VecDeque::with_capacity(config.backlog_lines.min(1024)),
                subscribers: Vec::new(),
                completed: None,
            }),
            config,
        }
    }

    /// Deliver one line to the backlog and every live subscriber.
    ///
    /// Ignored once the broker is closed.
    pub async fn publish(&self, line: &str) {
        let subscribers = {
            let mut state = self.state.lock();
            if state.completed.is_some() {
                return;
            }
            if state.backlog.len() >= self.config.backlog_lines {
                state.backlog.pop_front();
            }
            state.backlog.push_back(line.to_string());
            state.subscribers.clone()
        };

        let mut dropped = Vec::new();
        for tx in &subscribers {
            let event = OutputEvent::Line(line.to_string());
            if tx.send_timeout(event, self.config.send_timeout).await.is_err() {
                dropped.push(tx.clone());
            }
        }

        if !dropped.is_empty() {
            let mut state = self.state.lock();
            state
                .subscribers
                .retain(|s| !dropped.iter().any(|d| d.same_channel(s)));
            debug!(
                execution_id = self.execution_id.as_str(),
                dropped = dropped.len(),
                "dropped stalled or closed output subscribers"
            );
        }
    }

    /// Open a new subscription, starting with a replay of the backlog.
    ///
    /// Subscribing after close yields the backlog followed by the final
    /// record, then end of stream.
    pub fn subscribe(&self) -> mpsc::Receiver<OutputEvent> {
        let mut state = self.state.lock();
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1) + state.backlog.len() + 1);
        for line in &state.backlog {
            let _ = tx.try_send(OutputEvent::Line(line.clone()));
        }
        match &state.completed {
            Some(record) => {
                let _ = tx.try_send(OutputEvent::Completed(record.clone()));
            }
            None => state.subscribers.push(tx),
        }
        rx
    }

    /// Send the final record and end every subscription. Only the first call
    /// has any effect.
    pub async fn close(&self, record: &ExecutionRecord) {
        let subscribers = {
            let mut state = self.state.lock();
            if state.completed.is_some() {
                return;
            }
            state.completed = Some(Box::new(record.clone()));
            std::mem::take(&mut state.subscribers)
        };

        for tx in subscribers {
            let event = OutputEvent::Completed(Box::new(record.clone()));
            let _ = tx.send_timeout(event, self.config.send_timeout).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().completed.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionStatus, JobKind};
    use chrono::Utc;

    fn finished(id: &str) -> ExecutionRecord {
        let mut rec = ExecutionRecord::started(id, JobKind::SingleCommand);
        rec.finish(ExecutionStatus::Success, 0, Utc::now());
        rec
    }

    async fn collect(mut rx: mpsc::Receiver<OutputEvent>) -> (Vec<String>, Option<ExecutionRecord>) {
        let mut lines = Vec::new();
        let mut done = None;
        while let Some(event) = rx.recv().await {
            match event {
                OutputEvent::Line(l) => lines.push(l),
                OutputEvent::Completed(rec) => done = Some(*rec),
            }
        }
        (lines, done)
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_never_blocks() {
        let broker = OutputBroker::new("x", BrokerConfig::default());
        for i in 0..10_000 {
            broker.publish(&format!("line {}", i)).await;
        }
        let rec = finished("x");
        broker.close(&rec).await;
        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_backlog_then_live_lines() {
        let broker = OutputBroker::new("x", BrokerConfig::default());
        broker.publish("a").await;
        broker.publish("b").await;
        let rx = broker.subscribe();
        broker.publish("c").await;
        broker.close(&finished("x")).await;

        let (lines, done) = collect(rx).await;
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(done.unwrap().id, "x");
    }

    #[tokio::test]
    async fn test_backlog_is_bounded() {
        let broker = OutputBroker::new(
            "x",
            BrokerConfig {
                backlog_lines: 3,
                ..BrokerConfig::default()
            },
        );
        for l in ["1", "2", "3", "4", "5"] {
            broker.publish(l).await;
        }
        broker.close(&finished("x")).await;
        let (lines, done) = collect(broker.subscribe()).await;
        assert_eq!(lines, vec!["3", "4", "5"]);
        assert!(done.is_some());
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_dropped() {
        let broker = OutputBroker::new(
            "x",
            BrokerConfig {
                subscriber_capacity: 2,
                backlog_lines: 10,
                send_timeout: Duration::from_millis(50),
            },
        );
        let _stalled = broker.subscribe();
        for i in 0..5 {
            broker.publish(&i.to_string()).await;
        }
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = OutputBroker::new("x", BrokerConfig::default());
        let rx = broker.subscribe();
        let rec = finished("x");
        broker.close(&rec).await;
        broker.close(&rec).await;
        broker.publish("after close").await;

        let (lines, done) = collect(rx).await;
        assert!(lines.is_empty());
        assert!(done.is_some());
    }
}
