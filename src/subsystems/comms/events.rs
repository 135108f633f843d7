//! Server → client broadcast fan-out.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use super::protocol::WireEvent;

/// Cloneable sender for events every connected client should see.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<WireEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget; having no listeners is not an error.
    pub fn emit(&self, event: &str, data: Value) {
        if self.tx.send(WireEvent::new(event, data)).is_err() {
            trace!(event, "no listeners for broadcast");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.tx.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_emits() {
        let events = Broadcaster::new(8);
        events.emit("logs:entry", json!({})); // nobody listening yet
        let mut rx = events.subscribe();
        assert_eq!(events.listeners(), 1);
        events.emit("metrics:update", json!({ "cpuUsage": 3.0 }));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event, "metrics:update");
        assert_eq!(got.data["cpuUsage"], 3.0);
    }
}
