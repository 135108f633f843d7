//! Model discovery: the backend's `/models` listing, with a filesystem scan
//! of the models directory as fallback.
//!
//! Nothing here returns an error to the caller. An empty list means
//! "unknown", not "no models".

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// File extensions treated as model weights.
const MODEL_EXTENSIONS: &[&str] = &["gguf", "bin"];

/// Name fragment → chat template, first match wins.
const TEMPLATE_PATTERNS: &[(&str, &str)] = &[
    ("llama-3", "llama3"),
    ("llama3", "llama3"),
    ("mixtral", "mistral"),
    ("mistral", "mistral"),
    ("qwen", "chatml"),
    ("gemma", "gemma"),
    ("phi-3", "phi3"),
    ("phi3", "phi3"),
    ("deepseek", "deepseek"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type")]
    pub model_type: String,
    /// Unix seconds.
    pub modified_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Guess a chat template from a model name.
pub fn infer_template(name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    TEMPLATE_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, template)| template.to_string())
}

#[derive(Debug, Clone)]
pub struct ModelLoader {
    client: Client,
    base_url: String,
    models_dir: Option<PathBuf>,
}

impl ModelLoader {
    pub fn new(client: Client, base_url: impl Into<String>, models_dir: Option<PathBuf>) -> Self {
        Self { client, base_url: base_url.into(), models_dir }
    }

    /// Models the backend reports as loaded. `[]` on any failure.
    pub async fn fetch_loaded(&self) -> Vec<ModelDescriptor> {
        self.load_from_server().await.unwrap_or_default()
    }

    /// Backend listing first, then a scan of the models directory.
    pub async fn load(&self) -> Vec<ModelDescriptor> {
        if let Some(models) = self.load_from_server().await {
            if !models.is_empty() {
                return models;
            }
        }
        let Some(dir) = self.models_dir.clone() else {
            return Vec::new();
        };
        match tokio::task::spawn_blocking(move || scan_directory(&dir)).await {
            Ok(models) => models,
            Err(e) => {
                warn!("model scan task failed: {e}");
                Vec::new()
            }
        }
    }

    /// `None` when the backend is unreachable or answers with something
    /// that is not a model list.
    async fn load_from_server(&self) -> Option<Vec<ModelDescriptor>> {
        let url = format!("{}/models", self.base_url);
        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!("model listing unreachable: {e}");
                return None;
            }
        };
        if resp.status() != StatusCode::OK {
            debug!(status = %resp.status(), "model listing refused");
            return None;
        }
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                debug!("model listing is not JSON: {e}");
                return None;
            }
        };
        normalize_listing(&body)
    }
}

/// Accept either a bare array or `{ "data": [...] }`.
fn normalize_listing(body: &Value) -> Option<Vec<ModelDescriptor>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(map) => map.get("data")?.as_array()?,
        _ => return None,
    };
    let now = chrono::Utc::now().timestamp();
    Some(items.iter().filter_map(|item| descriptor_from_listing(item, now)).collect())
}

fn descriptor_from_listing(item: &Value, now: i64) -> Option<ModelDescriptor> {
    let id = item
        .get("id")
        .or_else(|| item.get("name"))
        .and_then(Value::as_str)?
        .to_string();
    Some(ModelDescriptor {
        name: id.clone(),
        path: item.get("path").and_then(Value::as_str).map(str::to_string),
        size: item.get("size").and_then(Value::as_u64).unwrap_or(0),
        model_type: item
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        modified_at: item.get("modified_at").and_then(Value::as_i64).unwrap_or(now),
        template: infer_template(&id),
        id,
    })
}

/// Find model files in `base` and one directory level below it.
/// Unreadable entries are skipped; a missing directory yields `[]`.
pub fn scan_directory(base: &Path) -> Vec<ModelDescriptor> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(base) else {
        debug!(dir = %base.display(), "models directory not readable");
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Ok(inner) = std::fs::read_dir(&path) {
                found.extend(inner.flatten().filter_map(|e| describe_file(&e.path())));
            }
        } else if let Some(model) = describe_file(&path) {
            found.push(model);
        }
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));
    found
}

fn describe_file(path: &Path) -> Option<ModelDescriptor> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !MODEL_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    let modified_at = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Some(ModelDescriptor {
        id: file_name,
        template: infer_template(&stem),
        name: stem,
        path: Some(path.display().to_string()),
        size: meta.len(),
        model_type: ext,
        modified_at,
    })
}
