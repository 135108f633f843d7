//! Supervisor: owns the bus and routes requests to subsystem handlers.

pub mod bus;
pub mod dispatch;

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bus::{BusError, BusMessage, ERR_METHOD_NOT_FOUND, SupervisorBus};
use dispatch::BusHandler;

/// Routing key for a method: everything before the first `:`.
pub fn method_prefix(method: &str) -> &str {
    method.split(':').next().unwrap_or_default()
}

/// Run the supervisor message loop until `shutdown` is cancelled.
///
/// Pure router: each message goes to the handler whose prefix matches the
/// method's first `:` segment. Requests for unknown prefixes are answered
/// with [`ERR_METHOD_NOT_FOUND`].
///
/// # Panics
///
/// Panics on startup if two handlers share the same prefix.
pub async fn run(
    mut bus: SupervisorBus,
    shutdown: CancellationToken,
    handlers: Vec<Box<dyn BusHandler>>,
) {
    let mut table: HashMap<String, Box<dyn BusHandler>> = HashMap::new();
    for h in handlers {
        let prefix = h.prefix().to_string();
        if table.insert(prefix.clone(), h).is_some() {
            panic!("duplicate BusHandler prefix registered: {prefix:?}");
        }
    }

    info!(handlers = ?table.keys().collect::<Vec<_>>(), "supervisor ready");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("supervisor shutting down");
                break;
            }

            msg = bus.rx.recv() => {
                match msg {
                    Some(BusMessage::Request { method, payload, reply_tx }) => {
                        let prefix = method_prefix(&method);
                        match table.get(prefix) {
                            Some(handler) => {
                                debug!(%method, %prefix, "routing request");
                                handler.handle_request(&method, payload, reply_tx);
                            }
                            None => {
                                warn!(%method, "unhandled request method");
                                let _ = reply_tx.send(Err(BusError::new(
                                    ERR_METHOD_NOT_FOUND,
                                    format!("method not found: {method}"),
                                )));
                            }
                        }
                    }
                    Some(BusMessage::Notification { method, payload }) => {
                        match table.get(method_prefix(&method)) {
                            Some(handler) => {
                                debug!(%method, "routing notification");
                                handler.handle_notification(&method, payload);
                            }
                            None => debug!(%method, "unhandled notification"),
                        }
                    }
                    None => {
                        info!("bus closed, supervisor exiting");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::bus::{BusPayload, BusResult};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    struct Echo {
        prefix: &'static str,
        notes: Arc<Mutex<Vec<String>>>,
    }

    impl BusHandler for Echo {
        fn prefix(&self) -> &str {
            self.prefix
        }

        fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
            let _ = reply_tx.send(Ok(json!({ "method": method, "payload": payload })));
        }

        fn handle_notification(&self, method: &str, _payload: BusPayload) {
            self.notes.lock().unwrap().push(method.to_string());
        }
    }

    fn echo(prefix: &'static str) -> (Box<dyn BusHandler>, Arc<Mutex<Vec<String>>>) {
        let notes = Arc::new(Mutex::new(Vec::new()));
        (Box::new(Echo { prefix, notes: notes.clone() }), notes)
    }

    #[test]
    fn prefix_is_first_segment() {
        assert_eq!(method_prefix("models:start"), "models");
        assert_eq!(method_prefix("config:get:result"), "config");
        assert_eq!(method_prefix("startModel"), "startModel");
    }

    #[tokio::test]
    async fn routes_by_prefix_and_rejects_unknown() {
        let bus = SupervisorBus::new(8);
        let handle = bus.handle.clone();
        let shutdown = CancellationToken::new();
        let (h, notes) = echo("config");
        let task = tokio::spawn(run(bus, shutdown.clone(), vec![h]));

        let reply = handle.request("config:get", json!({ "modelId": 1 })).await.unwrap().unwrap();
        assert_eq!(reply["method"], "config:get");
        assert_eq!(reply["payload"]["modelId"], 1);

        let err = handle.request("nope:get", json!({})).await.unwrap().unwrap_err();
        assert_eq!(err.code, ERR_METHOD_NOT_FOUND);

        handle.notify("config:changed", json!({})).unwrap();
        // a request after the notification guarantees it was processed
        handle.request("config:get", json!({})).await.unwrap().unwrap();
        assert_eq!(notes.lock().unwrap().as_slice(), ["config:changed"]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "duplicate BusHandler prefix")]
    async fn duplicate_prefix_panics() {
        let bus = SupervisorBus::new(1);
        let (a, _) = echo("logs");
        let (b, _) = echo("logs");
        run(bus, CancellationToken::new(), vec![a, b]).await;
    }
}
