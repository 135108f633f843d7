//! Comms subsystem: the HTTP and realtime surface of the daemon.
//!
//! # Architecture
//!
//! A single [`AxumChannel`] serves the REST routes under `/api/` and the
//! WebSocket endpoint at `http.ws_path`. It implements
//! [`runtime::Component`](crate::subsystems::runtime::Component) and is
//! spawned alongside the metrics collector by
//! [`spawn_components`](crate::subsystems::runtime::spawn_components).
//! Handlers never touch subsystems directly; they go through the
//! [`CommsState`] capability boundary, which forwards to the bus.
//!
//! An intra-subsystem [`mpsc`] channel lets running channels report
//! lifecycle events (connects, disconnects, shutdown). It is drained in a
//! background task that dies once every sender is dropped.
//!
//! ## URL layout
//!
//! ```text
//! GET    /api/health
//! GET    /api/models                          POST /api/models
//! GET    /api/models/discover
//! GET    /api/models/{id}                     PUT, DELETE
//! GET    /api/models/{id}/config
//! GET    /api/models/{id}/config/{category}   PUT
//! GET    /api/monitoring/latest
//! GET    /api/monitoring/history?minutes=N
//! GET    /api/llama/status
//! POST   /api/llama/start                     POST /api/llama/stop
//! POST   /api/llama/restart
//! GET    /api/settings                        PUT
//! GET    <ws_path>                            WebSocket upgrade
//! ```

mod api;
pub mod correlator;
pub mod events;
pub mod protocol;
pub mod rate_limit;
mod socket;
mod state;

pub use events::Broadcaster;
pub use protocol::WireEvent;
pub use state::{CommsEvent, CommsState};

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{HttpConfig, RealtimeConfig};
use crate::error::AppError;
use crate::subsystems::runtime::{Component, ComponentFuture};
use crate::supervisor::bus::BusHandle;

// ── State ─────────────────────────────────────────────────────────────────────

/// Build the shared [`CommsState`] and start draining its event queue.
pub fn new_state(bus: BusHandle, events: Broadcaster, realtime: &RealtimeConfig) -> Arc<CommsState> {
    let (event_tx, mut event_rx) = mpsc::channel::<CommsEvent>(32);
    let state = Arc::new(CommsState::new(bus, events, realtime, event_tx));

    // Monitoring only; lifecycle does not depend on it.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                CommsEvent::ChannelShutdown { ref channel_id } => {
                    debug!(channel_id, "channel reported shutdown");
                }
                CommsEvent::ClientConnected { ref client_id } => {
                    debug!(client_id, "realtime client connected");
                }
                CommsEvent::ClientDisconnected { ref client_id } => {
                    debug!(client_id, "realtime client disconnected");
                }
            }
        }
    });

    state
}

/// Axum router state injected into every handler via [`axum::extract::State`].
///
/// Cheap to clone; all fields are reference-counted.
#[derive(Clone)]
pub(crate) struct AxumState {
    /// Channel identifier used in log spans.
    pub channel_id: Arc<str>,
    pub comms: Arc<CommsState>,
    /// Cancelled at daemon shutdown; open sockets close on it.
    pub shutdown: CancellationToken,
    /// Outer bound on one REST request.
    pub request_timeout: Duration,
    /// Daemon name reported by `/api/health`.
    pub name: Arc<str>,
}

// ── AxumChannel ───────────────────────────────────────────────────────────────

pub struct AxumChannel {
    channel_id: String,
    name: String,
    http: HttpConfig,
    state: Arc<CommsState>,
}

impl AxumChannel {
    pub fn new(
        channel_id: impl Into<String>,
        name: impl Into<String>,
        http: &HttpConfig,
        state: Arc<CommsState>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            name: name.into(),
            http: http.clone(),
            state,
        }
    }
}

impl Component for AxumChannel {
    fn id(&self) -> &str {
        &self.channel_id
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(run_axum(*self, shutdown))
    }
}

// ── Server loop ───────────────────────────────────────────────────────────────

async fn run_axum(channel: AxumChannel, shutdown: CancellationToken) -> Result<(), AppError> {
    let AxumChannel { channel_id, name, http, state } = channel;
    let axum_state = AxumState {
        channel_id: Arc::from(channel_id.as_str()),
        comms: state.clone(),
        shutdown: shutdown.clone(),
        request_timeout: Duration::from_secs(http.request_timeout_secs.max(1)),
        name: Arc::from(name.as_str()),
    };

    let router = build_router(axum_state, &http.ws_path);

    let listener = TcpListener::bind(&http.bind)
        .await
        .map_err(|e| AppError::Comms(format!("axum bind failed on {}: {e}", http.bind)))?;

    info!(%channel_id, bind = %http.bind, ws_path = %http.ws_path, "axum channel listening");

    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await
        .map_err(|e| AppError::Comms(format!("axum server error: {e}")))?;

    state.report_event(CommsEvent::ChannelShutdown { channel_id: channel_id.clone() });
    info!(%channel_id, "axum channel shut down");
    Ok(())
}

// ── Router ────────────────────────────────────────────────────────────────────

pub(crate) fn build_router(state: AxumState, ws_path: &str) -> Router {
    Router::new()
        .route("/api/health",                           get(api::health))
        .route("/api/models",                           get(api::list_models).post(api::create_model))
        .route("/api/models/discover",                  get(api::discover_models))
        .route("/api/models/{id}",                      get(api::get_model).put(api::update_model).delete(api::delete_model))
        .route("/api/models/{id}/config",               get(api::model_config))
        .route("/api/models/{id}/config/{category}",    get(api::model_config_category).put(api::update_model_config))
        .route("/api/monitoring/latest",                get(api::latest_metrics))
        .route("/api/monitoring/history",               get(api::metrics_history))
        .route("/api/llama/status",                     get(api::llama_status))
        .route("/api/llama/start",                      post(api::llama_start))
        .route("/api/llama/stop",                       post(api::llama_stop))
        .route("/api/llama/restart",                    post(api::llama_restart))
        .route("/api/settings",                         get(api::get_settings).put(api::update_settings))
        .route(ws_path,                                 get(socket::upgrade))
        .with_state(state)
}
