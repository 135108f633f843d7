//! Subsystem modules for the llamaprox daemon.

pub mod comms;
pub mod llama;
pub mod logs;
pub mod metrics;
pub mod models;
pub mod runtime;
pub mod store;

use serde_json::json;

use crate::config::Config;
use crate::error::AppError;
use crate::supervisor::dispatch::BusHandler;
use comms::Broadcaster;
use comms::protocol::EVENT_LLAMA_STATUS;
use llama::LlamaService;
use llama::process::ProcessRegistry;
use llama::state::LlamaStatus;
use logs::{LogBuffer, LogLevel};
use store::Store;

/// Broadcast buffer per realtime subscriber.
const EVENT_CAPACITY: usize = 256;

/// Long-lived services shared by the bus handlers and components.
///
/// Every field is a cheap clonable handle.
#[derive(Clone)]
pub struct Services {
    pub store: Store,
    pub llama: LlamaService,
    pub registry: ProcessRegistry,
    pub events: Broadcaster,
    pub logs: LogBuffer,
}

impl Services {
    /// Build every service around an opened store. llama state changes are
    /// broadcast as `llamaStatus` and mirrored into the log ring.
    pub fn new(config: &Config, store: Store) -> Result<Self, AppError> {
        let events = Broadcaster::new(EVENT_CAPACITY);
        let logs = LogBuffer::new(events.clone());
        let llama = LlamaService::new(&config.llama)?;
        let registry = ProcessRegistry::new(&config.llama.server.server_path, &config.work_dir);
        models::track_exits(&registry, store.clone(), events.clone());

        let status_events = events.clone();
        let status_logs = logs.clone();
        llama.on_state_change(move |state| {
            status_events.emit(EVENT_LLAMA_STATUS, json!(state));
            let level = match state.status {
                LlamaStatus::Error => LogLevel::Error,
                _ => LogLevel::Info,
            };
            let message = match &state.last_error {
                Some(err) if state.status == LlamaStatus::Error => {
                    format!("llama-server {}: {err}", state.status)
                }
                _ => format!("llama-server {}", state.status),
            };
            status_logs.push(level, message, Some("llama".to_string()));
        });

        Ok(Self { store, llama, registry, events, logs })
    }
}

/// One handler per bus prefix.
pub fn bus_handlers(services: &Services) -> Vec<Box<dyn BusHandler>> {
    let handlers: Vec<Box<dyn BusHandler>> = vec![
        Box::new(llama::handler::LlamaSubsystem::new(services.llama.clone())),
        Box::new(models::ModelsSubsystem::new(
            services.store.clone(),
            services.llama.clone(),
            services.registry.clone(),
            services.events.clone(),
        )),
        Box::new(store::handlers::ConfigSubsystem::new(services.store.clone())),
        Box::new(store::handlers::SettingsSubsystem::new(services.store.clone())),
        Box::new(metrics::MetricsSubsystem::new(services.store.clone())),
        Box::new(logs::LogsSubsystem::new(services.logs.clone())),
    ];
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::store::temp_store;

    #[tokio::test]
    async fn handler_prefixes_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, store) = temp_store();
        let services = Services::new(&Config::test_default(dir.path()), store).unwrap();
        let handlers = bus_handlers(&services);
        let mut prefixes: Vec<_> = handlers.iter().map(|h| h.prefix().to_string()).collect();
        let n = prefixes.len();
        prefixes.sort();
        prefixes.dedup();
        assert_eq!(prefixes.len(), n);
        for p in ["llama", "models", "config", "settings", "metrics", "logs"] {
            assert!(prefixes.iter().any(|x| x == p), "missing {p}");
        }
    }

    #[tokio::test]
    async fn llama_transitions_are_broadcast_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, store) = temp_store();
        let mut cfg = Config::test_default(dir.path());
        cfg.llama.server.server_path = dir.path().join("missing-llama-server");
        let services = Services::new(&cfg, store).unwrap();
        let mut rx = services.events.subscribe();

        assert!(services.llama.launch().await.is_err());

        let mut saw_status = false;
        while let Ok(frame) = rx.try_recv() {
            saw_status |= frame.event == EVENT_LLAMA_STATUS;
        }
        assert!(saw_status);
        let logged = services.logs.recent(10);
        assert!(logged.iter().any(|e| e.source.as_deref() == Some("llama")));
    }
}
