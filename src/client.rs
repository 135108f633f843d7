//! Realtime client for the daemon's WebSocket channel.
//!
//! Requests go out through a [`Correlator`]; reply frames are matched back
//! to their waiter by `requestId`. Everything else the server pushes
//! (`connection`, `llamaStatus`, `metrics:update`, ...) is fanned out to
//! [`RealtimeClient::subscribe`] receivers.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

use crate::subsystems::comms::WireEvent;
use crate::subsystems::comms::correlator::{Correlator, CorrelatorError, Timeouts};

const OUTBOUND_BUFFER: usize = 32;
const PUSH_BUFFER: usize = 128;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error(transparent)]
    Request(#[from] CorrelatorError),
}

pub struct RealtimeClient {
    correlator: Arc<Correlator>,
    pushes: broadcast::Sender<WireEvent>,
}

impl RealtimeClient {
    /// Open `url` (for example `ws://127.0.0.1:3000/llamaproxws`) and start
    /// the reader and writer tasks.
    pub async fn connect(url: &str, timeouts: Timeouts) -> Result<Self, ClientError> {
        let (stream, _resp) = connect_async(url).await.map_err(|e| ClientError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (mut sink, mut stream) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WireEvent>(OUTBOUND_BUFFER);
        let correlator = Arc::new(Correlator::new(out_tx, timeouts));
        let (pushes, _) = broadcast::channel(PUSH_BUFFER);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = %frame.event, "frame not serializable: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    debug!("websocket write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_correlator = correlator.clone();
        let reader_pushes = pushes.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("websocket read failed: {e}");
                        break;
                    }
                };
                let frame: WireEvent = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("unparseable frame from server: {e}");
                        continue;
                    }
                };
                if !reader_correlator.resolve(&frame) {
                    let _ = reader_pushes.send(frame);
                }
            }
            reader_correlator.fail_all();
        });

        Ok(Self { correlator, pushes })
    }

    /// Send `event` and wait for its result frame.
    pub async fn request(&self, event: &str, data: Value) -> Result<Value, ClientError> {
        Ok(self.correlator.request(event, data).await?)
    }

    /// Server pushes that were not replies to a request.
    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.pushes.subscribe()
    }
}
