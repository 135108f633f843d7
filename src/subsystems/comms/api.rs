//! Axum handlers for `/api/*` routes.
//!
//! Each handler is a thin translation onto a bus method. Results come back
//! in an [`ApiEnvelope`]; bus error codes pick the HTTP status.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use super::AxumState;
use super::protocol::ApiEnvelope;
use crate::supervisor::bus::{
    BusError, ERR_INVALID_PARAMS, ERR_METHOD_NOT_FOUND, ERR_NOT_FOUND, ERR_TIMEOUT,
};

// ── Helpers ───────────────────────────────────────────────────────────────────

pub(super) fn status_for(e: &BusError) -> StatusCode {
    match e.code {
        ERR_INVALID_PARAMS => StatusCode::BAD_REQUEST,
        ERR_NOT_FOUND | ERR_METHOD_NOT_FOUND => StatusCode::NOT_FOUND,
        ERR_TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn forward(state: &AxumState, method: &str, payload: Value) -> Response {
    match tokio::time::timeout(state.request_timeout, state.comms.call(method, payload)).await {
        Ok(Ok(data)) => (StatusCode::OK, Json(ApiEnvelope::ok(data))).into_response(),
        Ok(Err(e)) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(channel_id = %state.channel_id, %method, "request failed: {}", e.message);
            }
            (status, Json(ApiEnvelope::err(e.message))).into_response()
        }
        Err(_) => {
            warn!(channel_id = %state.channel_id, %method, "request timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ApiEnvelope::err(format!("{method} timed out"))),
            )
                .into_response()
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// GET /api/health
pub(super) async fn health(State(state): State<AxumState>) -> Response {
    let llama = match state.comms.call("llama:status", Value::Null).await {
        Ok(v) => v["status"]["status"].clone(),
        Err(_) => Value::Null,
    };
    let body = json!({
        "status": "ok",
        "name": state.name.as_ref(),
        "version": env!("CARGO_PKG_VERSION"),
        "llama": llama,
    });
    (StatusCode::OK, Json(ApiEnvelope::ok(body))).into_response()
}

/// GET /api/models
pub(super) async fn list_models(State(state): State<AxumState>) -> Response {
    forward(&state, "models:list", Value::Null).await
}

/// POST /api/models
pub(super) async fn create_model(State(state): State<AxumState>, Json(body): Json<Value>) -> Response {
    forward(&state, "models:create", json!({ "model": body })).await
}

/// GET /api/models/discover
pub(super) async fn discover_models(State(state): State<AxumState>) -> Response {
    forward(&state, "models:discover", Value::Null).await
}

/// GET /api/models/{id}
pub(super) async fn get_model(State(state): State<AxumState>, Path(id): Path<i64>) -> Response {
    forward(&state, "models:get", json!({ "modelId": id })).await
}

/// PUT /api/models/{id}
pub(super) async fn update_model(
    State(state): State<AxumState>,
    Path(id): Path<i64>,
    Json(updates): Json<Value>,
) -> Response {
    forward(&state, "models:update", json!({ "modelId": id, "updates": updates })).await
}

/// DELETE /api/models/{id}
pub(super) async fn delete_model(State(state): State<AxumState>, Path(id): Path<i64>) -> Response {
    forward(&state, "models:delete", json!({ "modelId": id })).await
}

/// GET /api/models/{id}/config
pub(super) async fn model_config(State(state): State<AxumState>, Path(id): Path<i64>) -> Response {
    forward(&state, "config:get", json!({ "modelId": id })).await
}

/// GET /api/models/{id}/config/{category}
pub(super) async fn model_config_category(
    State(state): State<AxumState>,
    Path((id, category)): Path<(i64, String)>,
) -> Response {
    forward(&state, "config:get", json!({ "modelId": id, "type": category })).await
}

/// PUT /api/models/{id}/config/{category}
pub(super) async fn update_model_config(
    State(state): State<AxumState>,
    Path((id, category)): Path<(i64, String)>,
    Json(config): Json<Value>,
) -> Response {
    forward(
        &state,
        "config:update",
        json!({ "modelId": id, "type": category, "config": config }),
    )
    .await
}

/// GET /api/monitoring/latest
pub(super) async fn latest_metrics(State(state): State<AxumState>) -> Response {
    forward(&state, "metrics:get", Value::Null).await
}

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    minutes: Option<u64>,
}

/// GET /api/monitoring/history?minutes=N
pub(super) async fn metrics_history(
    State(state): State<AxumState>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let payload = match q.minutes {
        Some(minutes) => json!({ "minutes": minutes }),
        None => Value::Null,
    };
    forward(&state, "metrics:history", payload).await
}

/// GET /api/llama/status
pub(super) async fn llama_status(State(state): State<AxumState>) -> Response {
    forward(&state, "llama:status", Value::Null).await
}

/// POST /api/llama/start, with an optional `{ "config": {...} }` body.
pub(super) async fn llama_start(State(state): State<AxumState>, body: Bytes) -> Response {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(v) => v,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(ApiEnvelope::err(format!("invalid JSON body: {e}"))))
                    .into_response();
            }
        }
    };
    forward(&state, "llama:start", payload).await
}

/// POST /api/llama/stop
pub(super) async fn llama_stop(State(state): State<AxumState>) -> Response {
    forward(&state, "llama:stop", Value::Null).await
}

/// POST /api/llama/restart
pub(super) async fn llama_restart(State(state): State<AxumState>) -> Response {
    forward(&state, "llama:restart", Value::Null).await
}

/// GET /api/settings
pub(super) async fn get_settings(State(state): State<AxumState>) -> Response {
    forward(&state, "settings:get", Value::Null).await
}

/// PUT /api/settings; the body is the object of keys to merge.
pub(super) async fn update_settings(State(state): State<AxumState>, Json(body): Json<Value>) -> Response {
    forward(&state, "settings:update", json!({ "settings": body })).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_to_status() {
        let s = |code| status_for(&BusError::new(code, "x"));
        assert_eq!(s(ERR_INVALID_PARAMS), StatusCode::BAD_REQUEST);
        assert_eq!(s(ERR_NOT_FOUND), StatusCode::NOT_FOUND);
        assert_eq!(s(ERR_METHOD_NOT_FOUND), StatusCode::NOT_FOUND);
        assert_eq!(s(ERR_TIMEOUT), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(s(crate::supervisor::bus::ERR_INTERNAL), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
