//! `metrics:*` bus methods over the persisted history, plus the collector
//! component that fills it.

#[cfg(feature = "subsystem-metrics")]
pub mod collector;
#[cfg(feature = "subsystem-metrics")]
pub mod gpu;

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use crate::subsystems::store::Store;
use crate::supervisor::bus::{BusPayload, BusResult};
use crate::supervisor::dispatch::{BusHandler, blocking, method_not_found, params, spawn_reply};

const DEFAULT_HISTORY_MINUTES: u64 = 10;

#[derive(Deserialize)]
struct HistoryParams {
    #[serde(default = "default_minutes")]
    minutes: u64,
}

fn default_minutes() -> u64 {
    DEFAULT_HISTORY_MINUTES
}

pub struct MetricsSubsystem {
    store: Store,
}

impl MetricsSubsystem {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl BusHandler for MetricsSubsystem {
    fn prefix(&self) -> &str {
        "metrics"
    }

    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
        let store = self.store.clone();
        match method {
            "metrics:get" => spawn_reply(reply_tx, async move {
                let latest = blocking(move || store.latest_metrics()).await?;
                Ok(json!({ "metrics": latest }))
            }),
            "metrics:history" => spawn_reply(reply_tx, async move {
                let HistoryParams { minutes } = params(payload)?;
                let window = Duration::from_secs(minutes.max(1) * 60);
                let history = blocking(move || store.metrics_history(window)).await?;
                Ok(json!({ "history": history }))
            }),
            _ => {
                let _ = reply_tx.send(Err(method_not_found(method)));
            }
        }
    }
}
