//! Shared state for the comms subsystem: the capability boundary for
//! channels.
//!
//! Channels receive an `Arc<CommsState>` and are restricted to the methods
//! below. The raw [`BusHandle`] is private.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::warn;

use super::correlator::Timeouts;
use super::events::Broadcaster;
use super::protocol::WireEvent;
use super::rate_limit::{RateLimiter, Verdict};
use crate::config::RealtimeConfig;
use crate::supervisor::bus::{BusError, BusHandle, BusPayload, ERR_INTERNAL, ERR_TIMEOUT};

// ── Events ────────────────────────────────────────────────────────────────────

/// Events a channel sends back to the comms subsystem manager.
#[derive(Debug)]
pub enum CommsEvent {
    ChannelShutdown { channel_id: String },
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String },
}

// ── RequestCounter ────────────────────────────────────────────────────────────

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Requests seen in the trailing minute.
#[derive(Debug, Default)]
pub struct RequestCounter {
    seen: Mutex<VecDeque<Instant>>,
}

impl RequestCounter {
    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&self, now: Instant) {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        seen.push_back(now);
        prune(&mut seen, now);
    }

    pub fn per_minute(&self) -> usize {
        self.per_minute_at(Instant::now())
    }

    pub fn per_minute_at(&self, now: Instant) -> usize {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        prune(&mut seen, now);
        seen.len()
    }
}

fn prune(seen: &mut VecDeque<Instant>, now: Instant) {
    while seen
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= RATE_WINDOW)
    {
        seen.pop_front();
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

/// Shared state passed as `Arc<CommsState>` to every channel task.
pub struct CommsState {
    bus: BusHandle,
    events: Broadcaster,
    limiter: RateLimiter,
    timeouts: Timeouts,
    requests: RequestCounter,
    event_tx: mpsc::Sender<CommsEvent>,
}

impl CommsState {
    pub fn new(
        bus: BusHandle,
        events: Broadcaster,
        realtime: &RealtimeConfig,
        event_tx: mpsc::Sender<CommsEvent>,
    ) -> Self {
        Self {
            bus,
            events,
            limiter: RateLimiter::new(
                realtime.rate_limit_max_events,
                Duration::from_millis(realtime.rate_limit_window_ms),
                realtime.abuse_multiplier,
            ),
            timeouts: Timeouts::from(realtime),
            requests: RequestCounter::default(),
            event_tx,
        }
    }

    /// Call a bus method with the per-class timeout for `method`. Timeouts
    /// and transport failures are folded into [`BusError`].
    pub async fn call(&self, method: &str, payload: BusPayload) -> Result<Value, BusError> {
        self.requests.record();
        let after = self.timeouts.for_event(method);
        match tokio::time::timeout(after, self.bus.request(method, payload)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BusError::new(ERR_INTERNAL, format!("bus error: {e}"))),
            Err(_) => Err(BusError::new(
                ERR_TIMEOUT,
                format!("timeout: {method} got no response within {after:?}"),
            )),
        }
    }

    pub fn check_rate(&self, client_id: &str) -> Verdict {
        self.limiter.check(client_id)
    }

    /// Drop per-client bookkeeping on disconnect.
    pub fn forget_client(&self, client_id: &str) {
        self.limiter.remove(client_id);
    }

    pub fn tracked_clients(&self) -> usize {
        self.limiter.tracked_clients()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.events
    }

    /// Shared with the metrics collector for the requests-per-minute gauge.
    pub fn requests_per_minute(&self) -> usize {
        self.requests.per_minute()
    }

    /// Report an event to the comms subsystem manager.
    ///
    /// Non-blocking: drops the event and logs a warning if the manager is not
    /// keeping up or has already exited.
    pub fn report_event(&self, event: CommsEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("comms event dropped: {e}");
        }
    }
}
