//! Realtime WebSocket endpoint.
//!
//! Each connection gets a client id, announced in a `connection` event.
//! Inbound frames are rate limited per client, then routed to the bus as
//! `method_for(event)`; the reply goes back as `result_event(event)`.
//! Broadcasts (`llamaStatus`, `metrics:update`, `logs:entry`, model
//! changes) are forwarded to every connection.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::AxumState;
use super::protocol::{
    EVENT_CONNECTION, EVENT_ERROR, ResultPayload, WireEvent, method_for, result_event,
};
use super::rate_limit::Verdict;
use super::state::CommsEvent;

const OUTBOUND_BUFFER: usize = 64;

/// GET <ws_path>
pub(super) async fn upgrade(ws: WebSocketUpgrade, State(state): State<AxumState>) -> Response {
    ws.on_upgrade(move |socket| serve(socket, state))
}

fn encode(frame: &WireEvent) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!(event = %frame.event, "frame not serializable: {e}");
            None
        }
    }
}

fn error_event(code: &str, message: impl Into<String>) -> WireEvent {
    WireEvent::new(EVENT_ERROR, json!({ "code": code, "message": message.into() }))
}

async fn serve(socket: WebSocket, state: AxumState) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let comms = state.comms.clone();
    let (mut sink, mut stream) = socket.split();

    // Single writer so replies from request tasks never interleave.
    let (out_tx, mut out_rx) = mpsc::channel::<WireEvent>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Some(msg) = encode(&frame) else { continue };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    info!(channel_id = %state.channel_id, %client_id, "client connected");
    comms.report_event(CommsEvent::ClientConnected { client_id: client_id.clone() });
    let _ = out_tx
        .send(WireEvent::new(EVENT_CONNECTION, json!({ "clientId": client_id })))
        .await;

    let mut broadcasts = comms.subscribe();
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            inbound = stream.next() => {
                let text = match inbound {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                match comms.check_rate(&client_id) {
                    Verdict::Allowed => {}
                    Verdict::Limited => {
                        debug!(%client_id, "event rate limited");
                        let _ = out_tx.send(error_event("rate_limited", "Too many events")).await;
                        continue;
                    }
                    Verdict::Abusive => {
                        warn!(%client_id, "closing abusive client");
                        let _ = out_tx.send(error_event("rate_limited", "Connection closed: rate limit abuse")).await;
                        break;
                    }
                }
                match serde_json::from_str::<WireEvent>(text.as_str()) {
                    Ok(frame) => dispatch(&state, frame, out_tx.clone()),
                    Err(e) => {
                        let _ = out_tx.send(error_event("bad_frame", format!("unparsable frame: {e}"))).await;
                    }
                }
            }

            event = broadcasts.recv() => match event {
                Ok(frame) => {
                    if out_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(%client_id, skipped = n, "client lagging; broadcasts dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    comms.forget_client(&client_id);
    comms.report_event(CommsEvent::ClientDisconnected { client_id: client_id.clone() });
    drop(out_tx);
    let _ = writer.await;
    info!(channel_id = %state.channel_id, %client_id, "client disconnected");
}

/// Serve one request on its own task; the reply is queued on `out_tx`.
fn dispatch(state: &AxumState, frame: WireEvent, out_tx: mpsc::Sender<WireEvent>) {
    let comms = state.comms.clone();
    tokio::spawn(async move {
        let request_id = frame.request_id().map(str::to_string);
        let reply_event = result_event(&frame.event);
        let payload = match comms.call(method_for(&frame.event), frame.data).await {
            Ok(data) => ResultPayload::ok(request_id, data),
            Err(e) => {
                debug!(event = %frame.event, code = e.code, "request failed: {}", e.message);
                ResultPayload::err(request_id, Some(e.code), e.message)
            }
        };
        match serde_json::to_value(payload) {
            Ok(data) => {
                let _ = out_tx.send(WireEvent::new(reply_event, data)).await;
            }
            Err(e) => warn!(event = %reply_event, "reply not serializable: {e}"),
        }
    });
}
