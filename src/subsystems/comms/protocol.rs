//! Wire shapes for the realtime channel and REST envelopes.
//!
//! Every WebSocket frame is `{"event": <name>, "data": <value>}`. Requests
//! carry `data.requestId`; the reply goes out as `<event>:result` (or a
//! legacy alias) with a [`ResultPayload`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RESULT_SUFFIX: &str = ":result";

// server → client broadcasts
pub const EVENT_CONNECTION: &str = "connection";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_LLAMA_STATUS: &str = "llamaStatus";
pub const EVENT_METRICS_UPDATE: &str = "metrics:update";
pub const EVENT_LOG_ENTRY: &str = "logs:entry";

/// Legacy request events, their bus methods and reply names.
const LEGACY_EVENTS: &[(&str, &str, &str)] = &[
    ("startModel", "models:start", "modelStarted"),
    ("stopModel", "models:stop", "modelStopped"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl WireEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.data.get("requestId").and_then(Value::as_str)
    }
}

/// Bus method that serves an inbound event.
pub fn method_for(event: &str) -> &str {
    LEGACY_EVENTS
        .iter()
        .find(|(name, _, _)| *name == event)
        .map(|(_, method, _)| *method)
        .unwrap_or(event)
}

/// Event name used for the reply to `event`.
pub fn result_event(event: &str) -> String {
    LEGACY_EVENTS
        .iter()
        .find(|(name, _, _)| *name == event)
        .map(|(_, _, reply)| reply.to_string())
        .unwrap_or_else(|| format!("{event}{RESULT_SUFFIX}"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

/// `data` of a `<event>:result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: String,
}

impl ResultPayload {
    pub fn ok(request_id: Option<String>, data: Value) -> Self {
        Self { request_id, success: true, data: Some(data), error: None, timestamp: now() }
    }

    pub fn err(request_id: Option<String>, code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            data: None,
            error: Some(ErrorBody { message: message.into(), code }),
            timestamp: now(),
        }
    }
}

/// REST response envelope: `{success, data?, error?, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiEnvelope {
    pub fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None, timestamp: now() }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()), timestamp: now() }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_names() {
        assert_eq!(result_event("config:get"), "config:get:result");
        assert_eq!(result_event("startModel"), "modelStarted");
        assert_eq!(result_event("stopModel"), "modelStopped");
        assert_eq!(method_for("startModel"), "models:start");
        assert_eq!(method_for("models:list"), "models:list");
    }

    #[test]
    fn frame_shape() {
        let frame: WireEvent =
            serde_json::from_str(r#"{"event":"settings:get","data":{"requestId":"req_1"}}"#).unwrap();
        assert_eq!(frame.request_id(), Some("req_1"));

        let bare: WireEvent = serde_json::from_str(r#"{"event":"metrics:get"}"#).unwrap();
        assert!(bare.data.is_null());
        assert_eq!(bare.request_id(), None);
    }

    #[test]
    fn result_payload_camel_case() {
        let v = serde_json::to_value(ResultPayload::ok(Some("req_9".into()), json!([1]))).unwrap();
        assert_eq!(v["requestId"], "req_9");
        assert_eq!(v["success"], true);
        assert!(v.get("error").is_none());

        let e = serde_json::to_value(ResultPayload::err(None, Some(-32602), "bad")).unwrap();
        assert_eq!(e["error"]["message"], "bad");
        assert!(e.get("requestId").is_none());
    }

    #[test]
    fn envelope_omits_empty_fields() {
        let v = serde_json::to_value(ApiEnvelope::err("nope")).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "nope");
        assert!(v.get("data").is_none());
        assert!(v["timestamp"].is_string());
    }
}
