//! `models:*` bus methods.
//!
//! Record CRUD goes to the [`Store`]; `loaded`/`discover` ask the running
//! backend through the [`ModelLoader`]; `scan` imports model files found on
//! disk; `start`/`stop` drive the per-model [`ProcessRegistry`]. Mutations
//! are broadcast so every client can refresh.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::AppError;
use crate::subsystems::comms::Broadcaster;
use crate::subsystems::llama::LlamaService;
use crate::subsystems::llama::models::{ModelDescriptor, scan_directory};
use crate::subsystems::llama::process::ProcessRegistry;
use crate::subsystems::store::{ModelPatch, ModelStatus, NewModel, Store};
use crate::supervisor::bus::{BusError, BusPayload, BusResult};
use crate::supervisor::dispatch::{BusHandler, blocking, method_not_found, params, spawn_reply};

pub const EVENT_CREATED: &str = "models:created";
pub const EVENT_UPDATED: &str = "models:updated";
pub const EVENT_DELETED: &str = "models:deleted";
pub const EVENT_SCANNED: &str = "models:scanned";
pub const EVENT_STATUS: &str = "models:status";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ById {
    model_id: i64,
}

#[derive(Deserialize)]
struct Create {
    model: NewModel,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Update {
    model_id: i64,
    #[serde(default)]
    updates: ModelPatch,
}

/// `model` is the registry key; the legacy events send `modelName`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ByName {
    #[serde(alias = "modelName")]
    model: String,
}

#[derive(Clone)]
pub struct ModelsSubsystem {
    store: Store,
    llama: LlamaService,
    registry: ProcessRegistry,
    events: Broadcaster,
}

impl ModelsSubsystem {
    pub fn new(store: Store, llama: LlamaService, registry: ProcessRegistry, events: Broadcaster) -> Self {
        Self { store, llama, registry, events }
    }

    async fn scan(&self) -> Result<Value, BusError> {
        let dir: PathBuf = self
            .llama
            .config()
            .models_dir
            .ok_or_else(|| BusError::invalid_params("No models directory configured"))?;

        let store = self.store.clone();
        let (scanned, added) = blocking(move || {
            let found = scan_directory(&dir);
            let added = import_new(&store, &found)?;
            Ok((found.len(), added))
        })
        .await?;

        let total = {
            let store = self.store.clone();
            blocking(move || store.list_models()).await?.len()
        };
        info!(scanned, added, total, "model scan finished");
        let body = json!({ "scanned": scanned, "added": added, "total": total });
        self.events.emit(EVENT_SCANNED, body.clone());
        Ok(body)
    }

    async fn start_model(&self, name: String) -> Result<Value, BusError> {
        let process = self.registry.start(&name).await?;
        self.mark(&name, ModelStatus::Running).await;
        self.events.emit(EVENT_STATUS, json!({ "modelName": name, "status": "running" }));
        // An exit reported before the mark above would be overwritten by it.
        if self.registry.info(&name).map(|p| p.pid) != Some(process.pid) {
            self.mark(&name, ModelStatus::Stopped).await;
        }
        Ok(json!({ "process": process }))
    }

    async fn stop_model(&self, name: String) -> Result<Value, BusError> {
        let stopped = self.registry.stop(&name);
        if !stopped {
            return Err(AppError::NotFound(format!("model '{name}' is not running")).into());
        }
        self.mark(&name, ModelStatus::Stopped).await;
        self.events.emit(EVENT_STATUS, json!({ "modelName": name, "status": "stopped" }));
        Ok(json!({ "model": name, "stopped": true }))
    }

    /// Best effort: models started by name need not have a stored record.
    async fn mark(&self, name: &str, status: ModelStatus) {
        let store = self.store.clone();
        let owned = name.to_string();
        if let Err(e) = blocking(move || store.set_model_status(&owned, status)).await {
            warn!(model = name, "could not record model status: {}", e.message);
        }
    }
}

/// Mark registry models that exit on their own as stopped and tell clients.
pub fn track_exits(registry: &ProcessRegistry, store: Store, events: Broadcaster) {
    registry.on_exit(move |process| {
        let store = store.clone();
        let events = events.clone();
        let name = process.model.clone();
        warn!(model = %name, pid = process.pid, "model process exited unexpectedly");
        tokio::spawn(async move {
            let owned = name.clone();
            if let Err(e) = blocking(move || store.set_model_status(&owned, ModelStatus::Stopped)).await {
                warn!(model = %name, "could not record model exit: {}", e.message);
            }
            events.emit(EVENT_STATUS, json!({ "modelName": name, "status": "stopped" }));
        });
    });
}

/// Store every descriptor whose name is not yet known. Returns how many
/// were added.
fn import_new(store: &Store, found: &[ModelDescriptor]) -> Result<usize, AppError> {
    let mut known: HashSet<String> = store.list_models()?.into_iter().map(|m| m.name).collect();
    let mut added = 0;
    for model in found {
        if !known.insert(model.name.clone()) {
            continue;
        }
        let mut params = serde_json::Map::new();
        if let Some(template) = &model.template {
            params.insert("template".into(), Value::String(template.clone()));
        }
        store.create_model(NewModel {
            name: model.name.clone(),
            model_type: model.model_type.clone(),
            status: ModelStatus::Stopped,
            model_path: model.path.clone(),
            file_size: i64::try_from(model.size).ok(),
            params: Value::Object(params),
        })?;
        added += 1;
    }
    Ok(added)
}

impl BusHandler for ModelsSubsystem {
    fn prefix(&self) -> &str {
        "models"
    }

    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
        let this = self.clone();
        let store = self.store.clone();
        match method {
            "models:list" => spawn_reply(reply_tx, async move {
                let models = blocking(move || store.list_models()).await?;
                Ok(json!({ "models": models }))
            }),
            "models:get" => spawn_reply(reply_tx, async move {
                let ById { model_id } = params(payload)?;
                let model = blocking(move || store.get_model(model_id))
                    .await?
                    .ok_or_else(|| BusError::not_found(format!("model {model_id} not found")))?;
                Ok(json!({ "model": model }))
            }),
            "models:create" => spawn_reply(reply_tx, async move {
                let Create { model } = params(payload)?;
                let model = blocking(move || store.create_model(model)).await?;
                this.events.emit(EVENT_CREATED, json!({ "model": model }));
                Ok(json!({ "model": model }))
            }),
            "models:update" => spawn_reply(reply_tx, async move {
                let Update { model_id, updates } = params(payload)?;
                let model = blocking(move || store.update_model(model_id, updates)).await?;
                this.events.emit(EVENT_UPDATED, json!({ "model": model }));
                Ok(json!({ "model": model }))
            }),
            "models:delete" => spawn_reply(reply_tx, async move {
                let ById { model_id } = params(payload)?;
                blocking(move || store.delete_model(model_id)).await?;
                this.events.emit(EVENT_DELETED, json!({ "modelId": model_id }));
                Ok(json!({ "deletedId": model_id }))
            }),
            "models:loaded" => spawn_reply(reply_tx, async move {
                Ok(json!({ "models": this.llama.model_loader().fetch_loaded().await }))
            }),
            "models:discover" => spawn_reply(reply_tx, async move {
                Ok(json!({ "models": this.llama.model_loader().load().await }))
            }),
            "models:scan" => spawn_reply(reply_tx, async move { this.scan().await }),
            "models:start" => spawn_reply(reply_tx, async move {
                let ByName { model } = params(payload)?;
                this.start_model(model).await
            }),
            "models:stop" => spawn_reply(reply_tx, async move {
                let ByName { model } = params(payload)?;
                this.stop_model(model).await
            }),
            "models:running" => {
                let _ = reply_tx.send(Ok(json!({ "processes": self.registry.list() })));
            }
            _ => {
                let _ = reply_tx.send(Err(method_not_found(method)));
            }
        }
    }
}
