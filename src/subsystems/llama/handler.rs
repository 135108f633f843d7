//! `llama:*` bus methods: status, start, stop and restart of the supervised
//! server.

use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use super::LlamaService;
use crate::config::LlamaServerConfig;
use crate::supervisor::bus::{BusError, BusPayload, BusResult};
use crate::supervisor::dispatch::{BusHandler, method_not_found, params, spawn_reply};

#[derive(Debug, Default, Deserialize)]
struct StartParams {
    /// Replaces the launch config when present.
    #[serde(default)]
    config: Option<LlamaServerConfig>,
}

pub struct LlamaSubsystem {
    service: LlamaService,
}

impl LlamaSubsystem {
    pub fn new(service: LlamaService) -> Self {
        Self { service }
    }
}

impl BusHandler for LlamaSubsystem {
    fn prefix(&self) -> &str {
        "llama"
    }

    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
        let service = self.service.clone();
        match method {
            "llama:status" => {
                let _ = reply_tx.send(Ok(json!({ "status": service.state() })));
            }
            "llama:start" => {
                let start = match params::<StartParams>(payload) {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = reply_tx.send(Err(e));
                        return;
                    }
                };
                spawn_reply(reply_tx, async move {
                    let result = match start.config {
                        Some(cfg) => service.start(cfg).await,
                        None => service.launch().await,
                    };
                    result.map_err(BusError::from)?;
                    Ok(json!({ "status": service.state() }))
                });
            }
            "llama:stop" => spawn_reply(reply_tx, async move {
                service.stop().await.map_err(BusError::from)?;
                Ok(json!({ "status": service.state() }))
            }),
            "llama:restart" => spawn_reply(reply_tx, async move {
                service.restart().await.map_err(BusError::from)?;
                Ok(json!({ "status": service.state() }))
            }),
            _ => {
                let _ = reply_tx.send(Err(method_not_found(method)));
            }
        }
    }
}
