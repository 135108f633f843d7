//! In-memory log ring shared with clients through `logs:*`.
//!
//! Holds the most recent [`LOG_CAPACITY`] entries. Every added entry is
//! broadcast as `logs:entry`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;

use crate::error::AppError;
use crate::subsystems::comms::{Broadcaster, protocol::EVENT_LOG_ENTRY};
use crate::supervisor::bus::{BusPayload, BusResult};
use crate::supervisor::dispatch::{BusHandler, method_not_found, params};

pub const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: u64,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Ring {
    entries: VecDeque<LogEntry>,
    next_id: u64,
}

/// Bounded, clonable log buffer. Clones share the same ring.
#[derive(Clone)]
pub struct LogBuffer {
    ring: Arc<Mutex<Ring>>,
    events: Broadcaster,
}

impl LogBuffer {
    pub fn new(events: Broadcaster) -> Self {
        Self { ring: Arc::new(Mutex::new(Ring::default())), events }
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append an entry, evicting the oldest past capacity, and broadcast it.
    pub fn push(&self, level: LogLevel, message: impl Into<String>, source: Option<String>) -> LogEntry {
        let entry = {
            let mut ring = self.ring();
            ring.next_id += 1;
            let entry = LogEntry {
                id: ring.next_id,
                level,
                message: message.into(),
                source,
                timestamp: Utc::now(),
            };
            if ring.entries.len() == LOG_CAPACITY {
                ring.entries.pop_front();
            }
            ring.entries.push_back(entry.clone());
            entry
        };
        self.events.emit(EVENT_LOG_ENTRY, json!(entry));
        entry
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let ring = self.ring();
        let skip = ring.entries.len().saturating_sub(limit);
        ring.entries.iter().skip(skip).cloned().collect()
    }

    /// Empty the ring; returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut ring = self.ring();
        let n = ring.entries.len();
        ring.entries.clear();
        n
    }
}

#[derive(Deserialize)]
struct GetParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    LOG_CAPACITY
}

#[derive(Deserialize)]
struct AddParams {
    #[serde(default)]
    level: LogLevel,
    message: String,
    #[serde(default)]
    source: Option<String>,
}

pub struct LogsSubsystem {
    buffer: LogBuffer,
}

impl LogsSubsystem {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl BusHandler for LogsSubsystem {
    fn prefix(&self) -> &str {
        "logs"
    }

    // Buffer operations are short critical sections; answered inline.
    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
        let result = match method {
            "logs:get" => params::<GetParams>(payload)
                .map(|p| json!({ "logs": self.buffer.recent(p.limit) })),
            "logs:add" => params::<AddParams>(payload).and_then(|p| {
                if p.message.trim().is_empty() {
                    return Err(AppError::InvalidInput("log message must not be empty".into()).into());
                }
                Ok(json!({ "entry": self.buffer.push(p.level, p.message, p.source) }))
            }),
            "logs:clear" => Ok(json!({ "cleared": self.buffer.clear() })),
            _ => Err(method_not_found(method)),
        };
        let _ = reply_tx.send(result);
    }

    fn handle_notification(&self, method: &str, payload: BusPayload) {
        if method == "logs:add" {
            if let Ok(p) = params::<AddParams>(payload) {
                self.buffer.push(p.level, p.message, p.source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::bus::ERR_INVALID_PARAMS;
    use serde_json::Value;

    fn call(h: &LogsSubsystem, method: &str, payload: Value) -> BusResult {
        let (tx, mut rx) = oneshot::channel();
        h.handle_request(method, payload, tx);
        rx.try_recv().unwrap()
    }

    #[test]
    fn ring_keeps_newest_hundred() {
        let buffer = LogBuffer::new(Broadcaster::new(4));
        for i in 0..(LOG_CAPACITY + 5) {
            buffer.push(LogLevel::Info, format!("line {i}"), None);
        }
        let all = buffer.recent(usize::MAX);
        assert_eq!(all.len(), LOG_CAPACITY);
        assert_eq!(all[0].message, "line 5");
        assert_eq!(all.last().unwrap().message, format!("line {}", LOG_CAPACITY + 4));

        let tail = buffer.recent(2);
        assert_eq!(tail.len(), 2);
        assert!(tail[0].id < tail[1].id);
    }

    #[tokio::test]
    async fn add_broadcasts_entry() {
        let events = Broadcaster::new(4);
        let mut rx = events.subscribe();
        let h = LogsSubsystem::new(LogBuffer::new(events));

        let reply = call(&h, "logs:add", json!({ "level": "warn", "message": "disk low", "source": "ui" }))
            .unwrap();
        assert_eq!(reply["entry"]["level"], "warn");

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, EVENT_LOG_ENTRY);
        assert_eq!(frame.data["message"], "disk low");
    }

    #[test]
    fn get_clear_and_validation() {
        let h = LogsSubsystem::new(LogBuffer::new(Broadcaster::new(4)));
        call(&h, "logs:add", json!({ "message": "a" })).unwrap();
        call(&h, "logs:add", json!({ "message": "b" })).unwrap();

        let got = call(&h, "logs:get", json!({ "limit": 1 })).unwrap();
        assert_eq!(got["logs"].as_array().unwrap().len(), 1);
        assert_eq!(got["logs"][0]["message"], "b");
        assert_eq!(got["logs"][0]["level"], "info");

        assert_eq!(call(&h, "logs:clear", Value::Null).unwrap()["cleared"], 2);
        assert_eq!(call(&h, "logs:get", Value::Null).unwrap()["logs"], json!([]));

        let err = call(&h, "logs:add", json!({ "message": "  " })).unwrap_err();
        assert_eq!(err.code, ERR_INVALID_PARAMS);
        let err = call(&h, "logs:add", json!({ "level": "loud", "message": "x" })).unwrap_err();
        assert_eq!(err.code, ERR_INVALID_PARAMS);
    }
}
