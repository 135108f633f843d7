//! Supervisor event bus: request/notification messages between the comms
//! channels and the subsystem handlers.
//!
//! Payloads are plain JSON values, the same shape clients send over the
//! realtime channel, so comms can forward them without translation.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Body of a bus request or reply.
pub type BusPayload = Value;

/// What a handler sends back through `reply_tx`.
pub type BusResult = Result<BusPayload, BusError>;

// JSON-RPC style error codes.
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_INTERNAL: i32 = -32603;
pub const ERR_NOT_FOUND: i32 = -32004;
pub const ERR_UNAVAILABLE: i32 = -32005;
pub const ERR_TIMEOUT: i32 = -32008;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct BusError {
    pub code: i32,
    pub message: String,
}

impl BusError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ERR_NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ERR_INTERNAL, message)
    }
}

impl From<crate::error::AppError> for BusError {
    fn from(e: crate::error::AppError) -> Self {
        use crate::error::AppError;
        let code = match &e {
            AppError::InvalidInput(_) | AppError::Config(_) => ERR_INVALID_PARAMS,
            AppError::NotFound(_) => ERR_NOT_FOUND,
            AppError::Llama(_) => ERR_UNAVAILABLE,
            _ => ERR_INTERNAL,
        };
        Self::new(code, e.to_string())
    }
}

pub enum BusMessage {
    Request {
        method: String,
        payload: BusPayload,
        reply_tx: oneshot::Sender<BusResult>,
    },
    Notification {
        method: String,
        payload: BusPayload,
    },
}

/// Failure to get any reply at all, as opposed to a handler error.
#[derive(Debug, Error)]
pub enum BusCallError {
    #[error("bus closed")]
    Send,
    #[error("handler dropped the reply")]
    Recv,
    #[error("bus full")]
    Full,
}

/// Cloneable sending side of the bus.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<BusMessage>,
}

impl BusHandle {
    /// Send a request and await the handler's reply.
    pub async fn request(
        &self,
        method: impl Into<String>,
        payload: BusPayload,
    ) -> Result<BusResult, BusCallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BusMessage::Request { method: method.into(), payload, reply_tx })
            .await
            .map_err(|_| BusCallError::Send)?;
        reply_rx.await.map_err(|_| BusCallError::Recv)
    }

    /// Fire-and-forget. Never blocks; a full bus drops the message.
    pub fn notify(&self, method: impl Into<String>, payload: BusPayload) -> Result<(), BusCallError> {
        self.tx
            .try_send(BusMessage::Notification { method: method.into(), payload })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BusCallError::Full,
                mpsc::error::TrySendError::Closed(_) => BusCallError::Send,
            })
    }
}

/// Owns the supervisor-side receiver.
pub struct SupervisorBus {
    pub rx: mpsc::Receiver<BusMessage>,
    pub handle: BusHandle,
}

impl SupervisorBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        Self { rx, handle: BusHandle { tx } }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use serde_json::json;

    #[tokio::test]
    async fn request_round_trip() {
        let mut bus = SupervisorBus::new(4);
        let handle = bus.handle.clone();
        tokio::spawn(async move {
            if let Some(BusMessage::Request { method, payload, reply_tx }) = bus.rx.recv().await {
                assert_eq!(method, "settings:get");
                let _ = reply_tx.send(Ok(json!({ "echo": payload })));
            }
        });
        let reply = handle.request("settings:get", json!(1)).await.unwrap().unwrap();
        assert_eq!(reply["echo"], 1);
    }

    #[tokio::test]
    async fn dropped_reply_is_recv_error() {
        let mut bus = SupervisorBus::new(4);
        let handle = bus.handle.clone();
        tokio::spawn(async move {
            // receive and drop without answering
            let _ = bus.rx.recv().await;
        });
        assert!(matches!(handle.request("x:y", Value::Null).await, Err(BusCallError::Recv)));
    }

    #[test]
    fn notify_on_full_bus() {
        let bus = SupervisorBus::new(1);
        bus.handle.notify("logs:add", Value::Null).unwrap();
        assert!(matches!(bus.handle.notify("logs:add", Value::Null), Err(BusCallError::Full)));
    }

    #[test]
    fn app_errors_map_to_codes() {
        assert_eq!(BusError::from(AppError::InvalidInput("x".into())).code, ERR_INVALID_PARAMS);
        assert_eq!(BusError::from(AppError::NotFound("x".into())).code, ERR_NOT_FOUND);
        assert_eq!(BusError::from(AppError::Store("x".into())).code, ERR_INTERNAL);
    }
}
