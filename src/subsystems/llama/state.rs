//! Lifecycle state machine for the supervised llama-server.
//!
//! Every status change goes through [`transition`], a plain lookup table, so
//! restart and retry-budget behaviour can be tested without a process.
//! [`StateManager`] owns the current [`ServiceState`] and fans transitions
//! out to observers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::models::ModelDescriptor;

// Observer isolation relies on unwinding.
#[cfg(panic = "abort")]
compile_error!("llamaprox must be built with panic = \"unwind\"");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlamaStatus {
    Initial,
    Starting,
    Ready,
    Error,
    Crashed,
    Stopping,
}

impl LlamaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LlamaStatus::Initial => "initial",
            LlamaStatus::Starting => "starting",
            LlamaStatus::Ready => "ready",
            LlamaStatus::Error => "error",
            LlamaStatus::Crashed => "crashed",
            LlamaStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for LlamaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Validation passed; about to spawn or adopt a server.
    Launch,
    /// Validation failed before anything was spawned.
    LaunchRejected,
    /// Health endpoint answered.
    Healthy,
    HealthExhausted,
    SpawnFailed,
    /// Process exited without a stop request.
    Exited,
    RetryExhausted,
    StopRequested,
    Stopped,
}

/// The transition table. `None` means the event is not valid in `from`.
pub fn transition(from: LlamaStatus, event: LifecycleEvent) -> Option<LlamaStatus> {
    use LifecycleEvent as E;
    use LlamaStatus as S;

    match (from, event) {
        (S::Initial | S::Error | S::Crashed, E::Launch) => Some(S::Starting),
        (S::Initial | S::Error | S::Crashed, E::LaunchRejected) => Some(S::Error),
        (S::Starting, E::Healthy) => Some(S::Ready),
        (S::Starting, E::HealthExhausted) => Some(S::Error),
        (S::Starting, E::SpawnFailed) => Some(S::Error),
        (S::Starting | S::Ready, E::Exited) => Some(S::Crashed),
        (S::Crashed, E::RetryExhausted) => Some(S::Error),
        (s, E::StopRequested) if s != S::Stopping => Some(S::Stopping),
        (S::Stopping, E::Stopped) => Some(S::Initial),
        _ => None,
    }
}

/// Immutable snapshot handed to callers and observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub status: LlamaStatus,
    pub models: Vec<ModelDescriptor>,
    pub last_error: Option<String>,
    pub retries: u32,
    /// Seconds since `started_at` while running; frozen after a stop.
    pub uptime: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// Rejected transition; the state is left as it was.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {event:?} while {from}")]
pub struct InvalidTransition {
    pub from: LlamaStatus,
    pub event: LifecycleEvent,
}

pub type StateObserver = Arc<dyn Fn(&ServiceState) + Send + Sync>;

struct Inner {
    status: LlamaStatus,
    models: Vec<ModelDescriptor>,
    last_error: Option<String>,
    retries: u32,
    started_at: Option<DateTime<Utc>>,
    running_since: Option<Instant>,
    frozen_uptime: u64,
}

impl Inner {
    fn uptime(&self) -> u64 {
        match self.running_since {
            Some(since) => since.elapsed().as_secs(),
            None => self.frozen_uptime,
        }
    }

    fn snapshot(&self) -> ServiceState {
        ServiceState {
            status: self.status,
            models: self.models.clone(),
            last_error: self.last_error.clone(),
            retries: self.retries,
            uptime: self.uptime(),
            started_at: self.started_at,
        }
    }
}

pub struct StateManager {
    inner: Mutex<Inner>,
    observers: Mutex<Vec<StateObserver>>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: LlamaStatus::Initial,
                models: Vec::new(),
                last_error: None,
                retries: 0,
                started_at: None,
                running_since: None,
                frozen_uptime: 0,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means an earlier holder panicked; the data is
        // plain values and still consistent.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn snapshot(&self) -> ServiceState {
        self.lock().snapshot()
    }

    pub fn status(&self) -> LlamaStatus {
        self.lock().status
    }

    pub fn retries(&self) -> u32 {
        self.lock().retries
    }

    pub fn increment_retries(&self) -> u32 {
        let mut inner = self.lock();
        inner.retries += 1;
        inner.retries
    }

    pub fn set_models(&self, models: Vec<ModelDescriptor>) {
        self.lock().models = models;
    }

    pub fn subscribe(&self, observer: StateObserver) {
        self.observers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(observer);
    }

    /// Apply `event`. `error` is recorded as the last error when the new
    /// status is `error` or `crashed`.
    pub fn apply(
        &self,
        event: LifecycleEvent,
        error: Option<String>,
    ) -> Result<LlamaStatus, InvalidTransition> {
        let snapshot = {
            let mut inner = self.lock();
            let from = inner.status;
            let to = transition(from, event).ok_or(InvalidTransition { from, event })?;
            inner.status = to;
            match to {
                LlamaStatus::Ready => {
                    inner.retries = 0;
                    inner.last_error = None;
                    inner.started_at = Some(Utc::now());
                    inner.running_since = Some(Instant::now());
                }
                LlamaStatus::Error | LlamaStatus::Crashed => {
                    if error.is_some() {
                        inner.last_error = error;
                    }
                    inner.frozen_uptime = inner.uptime();
                    inner.running_since = None;
                }
                LlamaStatus::Stopping => {
                    inner.frozen_uptime = inner.uptime();
                    inner.running_since = None;
                }
                LlamaStatus::Initial => inner.models.clear(),
                LlamaStatus::Starting => {}
            }
            debug!(%from, %to, ?event, "llama state transition");
            inner.snapshot()
        };

        self.notify(&snapshot);
        Ok(snapshot.status)
    }

    /// Like [`apply`](Self::apply) but logs and drops invalid transitions.
    pub fn try_apply(&self, event: LifecycleEvent, error: Option<String>) -> bool {
        match self.apply(event, error) {
            Ok(_) => true,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    fn notify(&self, snapshot: &ServiceState) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(snapshot))).is_err() {
                error!(status = %snapshot.status, "state observer panicked");
            }
        }
    }
}
