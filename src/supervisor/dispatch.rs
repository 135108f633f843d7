//! Supervisor dispatch: the trait every subsystem handler implements.
//!
//! Methods are realtime event names such as `config:get` or `models:start`.
//! The supervisor routes on the first `:`-delimited segment and passes the
//! full method to the handler, which does its own secondary routing.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::AppError;
use crate::supervisor::bus::{BusError, BusPayload, BusResult, ERR_INTERNAL, ERR_METHOD_NOT_FOUND};

pub trait BusHandler: Send + Sync {
    /// Method prefix this handler owns (`"config"`, `"models"`, ...).
    /// Must be unique; the supervisor panics on duplicates.
    fn prefix(&self) -> &str;

    /// Handle a request, taking ownership of `reply_tx`.
    ///
    /// Must not block the supervisor loop: resolve `reply_tx` right away or
    /// move it into a spawned task.
    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>);

    /// Fire-and-forget messages. Ignored unless overridden.
    fn handle_notification(&self, _method: &str, _payload: BusPayload) {}
}

// ── Handler helpers ───────────────────────────────────────────────────────────

/// Resolve `reply_tx` from a spawned task so the supervisor loop never waits.
pub fn spawn_reply<F>(reply_tx: oneshot::Sender<BusResult>, fut: F)
where
    F: Future<Output = BusResult> + Send + 'static,
{
    tokio::spawn(async move {
        let _ = reply_tx.send(fut.await);
    });
}

/// Deserialize request params. A missing payload reads as `{}`.
pub fn params<T: DeserializeOwned>(payload: BusPayload) -> Result<T, BusError> {
    let payload = match payload {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(payload).map_err(|e| BusError::invalid_params(format!("invalid params: {e}")))
}

/// Run synchronous store work on the blocking pool.
pub async fn blocking<T, F>(work: F) -> Result<T, BusError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(BusError::from),
        Err(e) => Err(BusError::new(ERR_INTERNAL, format!("blocking task failed: {e}"))),
    }
}

pub fn method_not_found(method: &str) -> BusError {
    BusError::new(ERR_METHOD_NOT_FOUND, format!("method not found: {method}"))
}
