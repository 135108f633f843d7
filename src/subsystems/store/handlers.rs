//! Store-backed bus methods: `config:*` (per-model configuration) and
//! `settings:*` (the global settings object).

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::oneshot;

use super::{ConfigCategory, Store};
use crate::supervisor::bus::{BusError, BusPayload, BusResult};
use crate::supervisor::dispatch::{BusHandler, blocking, method_not_found, params, spawn_reply};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigGet {
    model_id: i64,
    #[serde(default, rename = "type")]
    category: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigUpdate {
    model_id: i64,
    #[serde(rename = "type")]
    category: String,
    config: Value,
}

fn category(name: &str) -> Result<ConfigCategory, BusError> {
    name.parse::<ConfigCategory>().map_err(BusError::from)
}

pub struct ConfigSubsystem {
    store: Store,
}

impl ConfigSubsystem {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl BusHandler for ConfigSubsystem {
    fn prefix(&self) -> &str {
        "config"
    }

    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
        let store = self.store.clone();
        match method {
            "config:get" => spawn_reply(reply_tx, async move {
                let req: ConfigGet = params(payload)?;
                let model_id = req.model_id;
                let config = match req.category {
                    None => blocking(move || store.get_complete_config(model_id)).await?,
                    Some(name) => {
                        let category = category(&name)?;
                        blocking(move || store.get_config(model_id, category))
                            .await?
                            .map(|r| r.config)
                            .unwrap_or_else(|| Value::Object(Map::new()))
                    }
                };
                Ok(json!({ "modelId": model_id, "config": config }))
            }),
            "config:update" => spawn_reply(reply_tx, async move {
                let req: ConfigUpdate = params(payload)?;
                let category = category(&req.category)?;
                let record =
                    blocking(move || store.upsert_config(req.model_id, category, &req.config)).await?;
                Ok(json!({ "config": record }))
            }),
            _ => {
                let _ = reply_tx.send(Err(method_not_found(method)));
            }
        }
    }
}

#[derive(Deserialize)]
struct SettingsUpdate {
    settings: Map<String, Value>,
}

pub struct SettingsSubsystem {
    store: Store,
}

impl SettingsSubsystem {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl BusHandler for SettingsSubsystem {
    fn prefix(&self) -> &str {
        "settings"
    }

    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
        let store = self.store.clone();
        match method {
            "settings:get" => spawn_reply(reply_tx, async move {
                let settings = blocking(move || store.settings()).await?;
                Ok(json!({ "settings": settings }))
            }),
            "settings:update" => spawn_reply(reply_tx, async move {
                let SettingsUpdate { settings } = params(payload)?;
                let merged = blocking(move || store.update_settings(settings)).await?;
                Ok(json!({ "settings": merged }))
            }),
            _ => {
                let _ = reply_tx.send(Err(method_not_found(method)));
            }
        }
    }
}
