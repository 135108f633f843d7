//! Request/response over a fire-and-forget event transport.
//!
//! Outbound requests are tagged with a fresh `requestId` and parked in the
//! pending map until the matching `<event>:result` frame comes back through
//! [`Correlator::resolve`]. Requests that outlive their timeout are evicted;
//! a response arriving after that is dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::protocol::{ResultPayload, WireEvent};
use crate::config::RealtimeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// Config, settings and status reads.
    Read,
    /// Process start/stop/restart and directory scans.
    Heavy,
    Standard,
}

const READ_SUFFIXES: &[&str] = &[":get", ":list", ":status", ":history", ":loaded"];
const HEAVY_SUFFIXES: &[&str] = &[":start", ":stop", ":restart", ":scan"];
const HEAVY_EVENTS: &[&str] = &["startModel", "stopModel"];

pub fn classify(event: &str) -> OperationClass {
    if HEAVY_EVENTS.contains(&event) || HEAVY_SUFFIXES.iter().any(|s| event.ends_with(s)) {
        OperationClass::Heavy
    } else if READ_SUFFIXES.iter().any(|s| event.ends_with(s)) {
        OperationClass::Read
    } else {
        OperationClass::Standard
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub read: Duration,
    pub heavy: Duration,
    pub standard: Duration,
}

impl Timeouts {
    pub fn for_event(&self, event: &str) -> Duration {
        match classify(event) {
            OperationClass::Read => self.read,
            OperationClass::Heavy => self.heavy,
            OperationClass::Standard => self.standard,
        }
    }
}

impl From<&RealtimeConfig> for Timeouts {
    fn from(cfg: &RealtimeConfig) -> Self {
        Self {
            read: Duration::from_millis(cfg.read_timeout_ms),
            heavy: Duration::from_millis(cfg.heavy_timeout_ms),
            standard: Duration::from_millis(cfg.default_timeout_ms),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            heavy: Duration::from_secs(120),
            standard: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("timeout: {event} got no response within {after:?}")]
    Timeout { event: String, after: Duration },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("transport closed")]
    Closed,
}

pub struct Correlator {
    outbound: mpsc::Sender<WireEvent>,
    pending: Mutex<HashMap<String, oneshot::Sender<ResultPayload>>>,
    timeouts: Timeouts,
}

impl Correlator {
    pub fn new(outbound: mpsc::Sender<WireEvent>, timeouts: Timeouts) -> Self {
        Self { outbound, pending: Mutex::new(HashMap::new()), timeouts }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ResultPayload>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Send `event` and wait for its result with the class timeout.
    pub async fn request(&self, event: &str, data: Value) -> Result<Value, CorrelatorError> {
        self.request_with_timeout(event, data, self.timeouts.for_event(event)).await
    }

    pub async fn request_with_timeout(
        &self,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, CorrelatorError> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        let mut body = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        body.insert("requestId".into(), Value::String(request_id.clone()));

        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id.clone(), tx);

        if self.outbound.send(WireEvent::new(event, Value::Object(body))).await.is_err() {
            self.pending().remove(&request_id);
            return Err(CorrelatorError::Closed);
        }
        debug!(event, request_id = %request_id, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) if payload.success => Ok(payload.data.unwrap_or(Value::Null)),
            Ok(Ok(payload)) => Err(CorrelatorError::Remote(
                payload
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "request failed".to_string()),
            )),
            Ok(Err(_)) => Err(CorrelatorError::Closed),
            Err(_) => {
                self.pending().remove(&request_id);
                warn!(event, request_id = %request_id, "request timed out");
                Err(CorrelatorError::Timeout { event: event.to_string(), after: timeout })
            }
        }
    }

    /// Hand an inbound frame to its waiting request. `false` when nothing
    /// was waiting: no id, an unknown id, or a late response.
    pub fn resolve(&self, frame: &WireEvent) -> bool {
        let Some(id) = frame.request_id() else {
            return false;
        };
        let Some(tx) = self.pending().remove(id) else {
            debug!(event = %frame.event, request_id = id, "no pending request; dropping response");
            return false;
        };
        let payload = serde_json::from_value::<ResultPayload>(frame.data.clone()).unwrap_or_else(|e| {
            ResultPayload::err(Some(id.to_string()), None, format!("malformed response: {e}"))
        });
        tx.send(payload).is_ok()
    }

    /// Drop every waiter; they fail with [`CorrelatorError::Closed`].
    pub fn fail_all(&self) {
        self.pending().clear();
    }
}
