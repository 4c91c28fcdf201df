use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

/// Events surfaced through `core_events` and the aggregator's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MusterEvent {
    UpstreamConnected {
        name: String,
    },
    UpstreamDisconnected {
        name: String,
        error: Option<String>,
    },
    UpstreamAuthRequired {
        name: String,
        issuer: Option<String>,
    },
    CapabilitiesChanged {
        version: u64,
        tools: usize,
        resources: usize,
        prompts: usize,
    },
    ServiceStateChanged {
        name: String,
        state: String,
        error: Option<String>,
    },
    ServiceHealthChanged {
        name: String,
        health: String,
    },
    AuthCompleted {
        endpoint: String,
    },
}

/// A recorded event with its arrival timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: MusterEvent,
}

/// Bounded in-memory event log with live fan-out.
///
/// `core_events` reads the ring buffer; long-lived observers subscribe to
/// the broadcast side. A restart starts empty, matching the no-persistence
/// contract.
pub struct EventLog {
    buffer: Mutex<VecDeque<RecordedEvent>>,
    capacity: usize,
    tx: broadcast::Sender<RecordedEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    pub fn record(&self, event: MusterEvent) {
        let recorded = RecordedEvent {
            at: Utc::now(),
            event,
        };
        if let Ok(mut buffer) = self.buffer.lock() {
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(recorded.clone());
        }
        // No receivers is fine; the ring buffer is the durable-ish side.
        let _ = self.tx.send(recorded);
    }

    /// Most recent events, oldest first, at most `limit`.
    pub fn recent(&self, limit: usize) -> Vec<RecordedEvent> {
        match self.buffer.lock() {
            Ok(buffer) => buffer
                .iter()
                .rev()
                .take(limit)
                .rev()
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordedEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ring_buffer_drops_oldest() {
        let log = EventLog::new(2);
        for name in ["a", "b", "c"] {
            log.record(MusterEvent::UpstreamConnected {
                name: name.to_string(),
            });
        }

        let names: Vec<String> = log
            .recent(10)
            .into_iter()
            .map(|r| match r.event {
                MusterEvent::UpstreamConnected { name } => name,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn recent_respects_limit() {
        let log = EventLog::new(8);
        for i in 0..5 {
            log.record(MusterEvent::CapabilitiesChanged {
                version: i,
                tools: 0,
                resources: 0,
                prompts: 0,
            });
        }
        assert_eq!(log.recent(2).len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_live_events() {
        let log = EventLog::default();
        let mut rx = log.subscribe();
        log.record(MusterEvent::AuthCompleted {
            endpoint: "https://muster.local".to_string(),
        });
        let got = rx.recv().await.expect("event");
        assert!(matches!(got.event, MusterEvent::AuthCompleted { .. }));
    }
}
