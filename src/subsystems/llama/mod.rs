//! llama-server supervision.
//!
//! [`LlamaService`] owns at most one backend process. It validates the
//! launch config, spawns the server, waits for `/health` and loads the model
//! list. An exit monitor turns unexpected exits into crash restarts under
//! the [`RetryPolicy`] budget. All status changes go through the transition
//! table in [`state`].

pub mod args;
pub mod handler;
pub mod health;
pub mod models;
pub mod process;
pub mod retry;
pub mod state;

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{LlamaConfig, LlamaServerConfig};
use crate::error::AppError;

use health::HealthChecker;
use models::ModelLoader;
use process::{Signal, find_executable, send_signal};
use retry::{RetryDecision, RetryPolicy};
use state::{LifecycleEvent, LlamaStatus, ServiceState, StateManager};

/// Grace period after SIGKILL before giving up on the exit notification.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Longest a `restart()` can take before it resolves: stop with SIGKILL
/// escalation, the adoption probe, the full readiness wait and the model
/// listing. Callers waiting on a start or restart need at least this much.
pub fn start_budget(config: &LlamaConfig) -> Duration {
    Duration::from_millis(config.stop_timeout_ms)
        + KILL_GRACE
        + health::HEALTH_PROBE_TIMEOUT
        + health::wait_budget(
            config.max_health_checks.max(1),
            Duration::from_millis(config.health_check_interval_ms),
        )
        + health::HTTP_TIMEOUT
}

struct TrackedChild {
    pid: u32,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

struct Inner {
    state: StateManager,
    config: Mutex<LlamaServerConfig>,
    client: Client,
    retry: RetryPolicy,
    max_health_checks: u32,
    health_interval: Duration,
    stop_timeout: Duration,
    child: Mutex<Option<TrackedChild>>,
    generation: AtomicU64,
}

/// Handle to the supervisor. Clones share the same process slot.
#[derive(Clone)]
pub struct LlamaService {
    inner: Arc<Inner>,
}

impl LlamaService {
    pub fn new(config: &LlamaConfig) -> Result<Self, AppError> {
        Ok(Self {
            inner: Arc::new(Inner {
                state: StateManager::new(),
                config: Mutex::new(config.server.clone()),
                client: health::http_client()?,
                retry: RetryPolicy::new(
                    config.max_retries,
                    Duration::from_millis(config.retry_base_ms),
                ),
                max_health_checks: config.max_health_checks.max(1),
                health_interval: Duration::from_millis(config.health_check_interval_ms),
                stop_timeout: Duration::from_millis(config.stop_timeout_ms),
                child: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.snapshot()
    }

    pub fn status(&self) -> LlamaStatus {
        self.inner.state.status()
    }

    /// Launch config used by the next start or restart.
    pub fn config(&self) -> LlamaServerConfig {
        self.inner
            .config
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child_slot().as_ref().map(|c| c.pid)
    }

    /// Register an observer for every state transition. Panics inside the
    /// callback are caught and logged.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&ServiceState) + Send + Sync + 'static,
    {
        self.inner.state.subscribe(Arc::new(callback));
    }

    /// Loader bound to the current launch config's backend and models dir.
    pub fn model_loader(&self) -> ModelLoader {
        let cfg = self.config();
        ModelLoader::new(self.inner.client.clone(), cfg.base_url(), cfg.models_dir.clone())
    }

    pub(crate) fn state_manager(&self) -> &StateManager {
        &self.inner.state
    }

    fn child_slot(&self) -> std::sync::MutexGuard<'_, Option<TrackedChild>> {
        self.inner.child.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the launch config and start the server.
    pub async fn start(&self, config: LlamaServerConfig) -> Result<(), AppError> {
        *self.inner.config.lock().unwrap_or_else(|p| p.into_inner()) = config;
        self.launch().await
    }

    /// Start with the current launch config.
    pub async fn launch(&self) -> Result<(), AppError> {
        match self.status() {
            LlamaStatus::Ready => {
                info!("llama-server already running");
                return Ok(());
            }
            LlamaStatus::Starting => {
                debug!("llama-server start already in progress");
                return Ok(());
            }
            LlamaStatus::Stopping => {
                return Err(AppError::Llama("llama-server is stopping".into()));
            }
            _ => {}
        }

        let cfg = self.config();
        if let Err(e) = validate(&cfg) {
            error!("llama-server launch rejected: {e}");
            self.inner.state.try_apply(LifecycleEvent::LaunchRejected, Some(e.to_string()));
            return Err(e);
        }

        // Status check and transition happen under one lock; a concurrent
        // caller that lost the race sees `starting` and backs off here.
        if self.inner.state.apply(LifecycleEvent::Launch, None).is_err() {
            debug!("llama-server start raced with another caller");
            return Ok(());
        }

        let health = HealthChecker::new(self.inner.client.clone(), cfg.base_url());
        if health.check().await {
            info!(url = %cfg.base_url(), "adopting llama-server that is already running");
            return self.become_ready(&cfg).await;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut exited = match self.spawn(&cfg, generation) {
            Ok(exited) => exited,
            Err(e) => {
                error!("{e}");
                self.inner.state.try_apply(LifecycleEvent::SpawnFailed, Some(e.to_string()));
                return Err(e);
            }
        };

        tokio::select! {
            ready = health.wait_for_ready(self.inner.max_health_checks, self.inner.health_interval) => {
                match ready {
                    Ok(()) => self.become_ready(&cfg).await,
                    Err(e) => {
                        error!("{e}");
                        self.inner.state.try_apply(LifecycleEvent::HealthExhausted, Some(e.to_string()));
                        self.force_kill(generation);
                        Err(e)
                    }
                }
            }
            _ = async { let _ = exited.wait_for(|done| *done).await; } => {
                // The exit monitor owns crash handling from here.
                match self.status() {
                    LlamaStatus::Stopping | LlamaStatus::Initial => Ok(()),
                    _ => Err(AppError::Llama("llama-server exited during startup".into())),
                }
            }
        }
    }

    fn spawn(&self, cfg: &LlamaServerConfig, generation: u64) -> Result<watch::Receiver<bool>, AppError> {
        let argv = args::build_args(cfg);
        debug!(exe = %cfg.server_path.display(), args = ?argv, "spawning llama-server");

        let child = Command::new(&cfg.server_path)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AppError::Llama(format!("failed to spawn {}: {e}", cfg.server_path.display()))
            })?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::Llama("llama-server exited before reporting a pid".into()))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        *self.child_slot() = Some(TrackedChild {
            pid,
            generation,
            kill_tx: Some(kill_tx),
            exited: exited_rx.clone(),
        });
        info!(pid, port = cfg.port, "llama-server spawned");

        self.spawn_monitor(child, generation, kill_rx, exited_tx);
        Ok(exited_rx)
    }

    fn spawn_monitor(
        &self,
        mut child: Child,
        generation: u64,
        mut kill_rx: oneshot::Receiver<()>,
        exited_tx: watch::Sender<bool>,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let _ = exited_tx.send(true);
            let detail = match &status {
                Ok(s) => format!("llama-server exited: {s}"),
                Err(e) => format!("llama-server wait failed: {e}"),
            };
            service.on_exit(generation, detail).await;
        });
    }

    async fn on_exit(&self, generation: u64, detail: String) {
        {
            let mut slot = self.child_slot();
            if slot.as_ref().map(|c| c.generation) == Some(generation) {
                slot.take();
            }
        }
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "exit of a superseded llama-server");
            return;
        }
        match self.status() {
            LlamaStatus::Starting | LlamaStatus::Ready => {
                warn!("{detail}");
                if self.inner.state.try_apply(LifecycleEvent::Exited, Some(detail)) {
                    self.handle_crash().await;
                }
            }
            status => debug!(%status, "{detail}"),
        }
    }

    /// Restart after a crash while the retry budget lasts; otherwise park
    /// in `error`.
    pub async fn handle_crash(&self) {
        let retries = self.inner.state.retries();
        match self.inner.retry.decide(retries) {
            RetryDecision::Exhausted => {
                error!(retries, "llama-server retry budget exhausted");
                self.inner
                    .state
                    .try_apply(LifecycleEvent::RetryExhausted, Some("Max retries exceeded".into()));
            }
            RetryDecision::RetryAfter(delay) => {
                let attempt = self.inner.state.increment_retries();
                warn!(attempt, delay_ms = delay.as_millis() as u64, "restarting llama-server");
                tokio::time::sleep(delay).await;
                if self.status() != LlamaStatus::Crashed {
                    debug!(status = %self.status(), "restart abandoned");
                    return;
                }
                if let Err(e) = self.launch().await {
                    warn!(attempt, "llama-server restart failed: {e}");
                }
            }
        }
    }

    /// Stop, then launch again with the current config.
    pub async fn restart(&self) -> Result<(), AppError> {
        self.stop().await?;
        self.launch().await
    }

    async fn become_ready(&self, cfg: &LlamaServerConfig) -> Result<(), AppError> {
        let loader = ModelLoader::new(self.inner.client.clone(), cfg.base_url(), cfg.models_dir.clone());
        let models = loader.load().await;
        debug!(count = models.len(), "models loaded");
        self.inner.state.set_models(models);
        self.inner
            .state
            .apply(LifecycleEvent::Healthy, None)
            .map_err(|e| AppError::Llama(e.to_string()))?;
        info!(url = %cfg.base_url(), "llama-server ready");
        Ok(())
    }

    fn force_kill(&self, generation: u64) {
        let mut slot = self.child_slot();
        if let Some(child) = slot.as_mut().filter(|c| c.generation == generation) {
            if let Some(tx) = child.kill_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    /// SIGTERM the tracked process, escalating to SIGKILL after the stop
    /// timeout, and return to `initial`.
    pub async fn stop(&self) -> Result<(), AppError> {
        if self.status() == LlamaStatus::Stopping {
            return Ok(());
        }
        self.inner.state.try_apply(LifecycleEvent::StopRequested, None);

        let tracked = self.child_slot().take();
        if let Some(mut child) = tracked {
            info!(pid = child.pid, "stopping llama-server");
            if let Err(e) = send_signal(child.pid, Signal::Term) {
                debug!(pid = child.pid, "SIGTERM failed: {e}");
            }
            if !wait_exit(&mut child.exited, self.inner.stop_timeout).await {
                warn!(pid = child.pid, "llama-server ignored SIGTERM, killing");
                if let Some(tx) = child.kill_tx.take() {
                    let _ = tx.send(());
                }
                if !wait_exit(&mut child.exited, KILL_GRACE).await {
                    error!(pid = child.pid, "llama-server did not exit after SIGKILL");
                }
            }
        }

        self.inner.state.try_apply(LifecycleEvent::Stopped, None);
        Ok(())
    }
}

/// Check the executable and model file before anything is spawned.
fn validate(cfg: &LlamaServerConfig) -> Result<(), AppError> {
    if find_executable(&cfg.server_path).is_none() {
        return Err(AppError::Config(format!(
            "llama-server binary not found: {}",
            cfg.server_path.display()
        )));
    }
    if let Some(model) = &cfg.model_path {
        if !model.is_file() {
            return Err(AppError::Config(format!("model file not found: {}", model.display())));
        }
    }
    Ok(())
}

/// `true` once the monitor reports the exit, `false` on timeout.
async fn wait_exit(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}
