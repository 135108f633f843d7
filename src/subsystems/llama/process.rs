//! OS process plumbing: signals, model binary lookup and the per-model
//! process registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::AppError;

/// Launch defaults for registry-started models.
const REGISTRY_CTX_SIZE: &str = "2048";
const REGISTRY_GPU_LAYERS: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// Deliver `signal` to `pid`.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 { Ok(()) } else { Err(std::io::Error::last_os_error()) }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: Signal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are only supported on unix",
    ))
}

/// Where a model's weights live under the data root:
/// `<root>/data/models/<model>/model.bin`.
pub fn resolve_binary(root: &Path, model: &str) -> PathBuf {
    root.join("data").join("models").join(model).join("model.bin")
}

/// `false` on any filesystem error, including a missing file.
pub async fn binary_exists(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file(),
        Err(e) => {
            debug!(path = %path.display(), "binary check failed: {e}");
            false
        }
    }
}

/// Locate an executable. Bare names are searched on `PATH`; anything with a
/// directory component must point at an existing file.
pub fn find_executable(path: &Path) -> Option<PathBuf> {
    if path.is_absolute() || path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
}

/// A model process started through the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedProcess {
    pub pid: u32,
    /// Unix milliseconds.
    pub launched_at: i64,
    pub model: String,
    pub model_path: PathBuf,
}

/// Called when a tracked process exits without a [`ProcessRegistry::stop`].
pub type ExitObserver = Arc<dyn Fn(&ManagedProcess) + Send + Sync>;

/// Tracks one detached llama process per model name.
///
/// Cloning shares the same map.
#[derive(Clone)]
pub struct ProcessRegistry {
    executable: PathBuf,
    data_root: PathBuf,
    tracked: Arc<Mutex<HashMap<String, ManagedProcess>>>,
    exit_observer: Arc<Mutex<Option<ExitObserver>>>,
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("executable", &self.executable)
            .field("data_root", &self.data_root)
            .field("tracked", &self.list())
            .finish_non_exhaustive()
    }
}

impl ProcessRegistry {
    pub fn new(executable: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            data_root: data_root.into(),
            tracked: Arc::new(Mutex::new(HashMap::new())),
            exit_observer: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the observer for processes that exit on their own.
    pub fn on_exit<F>(&self, observer: F)
    where
        F: Fn(&ManagedProcess) + Send + Sync + 'static,
    {
        *self.exit_observer.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(observer));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ManagedProcess>> {
        self.tracked.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn resolve_binary(&self, model: &str) -> PathBuf {
        resolve_binary(&self.data_root, model)
    }

    pub async fn binary_exists(&self, model: &str) -> bool {
        binary_exists(&self.resolve_binary(model)).await
    }

    pub fn info(&self, model: &str) -> Option<ManagedProcess> {
        self.lock().get(model).cloned()
    }

    pub fn list(&self) -> Vec<ManagedProcess> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.model.cmp(&b.model));
        all
    }

    /// Launch `model` unless it is already tracked, in which case the
    /// existing record is returned.
    pub async fn start(&self, model: &str) -> Result<ManagedProcess, AppError> {
        if model.is_empty() || model.contains(['/', '\\']) || model == ".." {
            return Err(AppError::InvalidInput(format!("bad model name: '{model}'")));
        }
        if let Some(existing) = self.info(model) {
            debug!(model, pid = existing.pid, "model already running");
            return Ok(existing);
        }

        let binary = self.resolve_binary(model);
        if !binary_exists(&binary).await {
            return Err(AppError::NotFound(format!(
                "model binary not found: {}",
                binary.display()
            )));
        }

        let mut child = Command::new(&self.executable)
            .arg("-m")
            .arg(&binary)
            .args(["-c", REGISTRY_CTX_SIZE, "-ngl", REGISTRY_GPU_LAYERS])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AppError::Llama(format!("failed to spawn {}: {e}", self.executable.display()))
            })?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::Llama("spawned process exited before reporting a pid".into()))?;

        let record = ManagedProcess {
            pid,
            launched_at: chrono::Utc::now().timestamp_millis(),
            model: model.to_string(),
            model_path: binary,
        };

        let raced = {
            let mut tracked = self.lock();
            match tracked.get(model) {
                Some(existing) => Some(existing.clone()),
                None => {
                    tracked.insert(model.to_string(), record.clone());
                    None
                }
            }
        };
        if let Some(existing) = raced {
            // A concurrent start won; drop ours.
            let _ = child.start_kill();
            return Ok(existing);
        }

        info!(model, pid, "model process started");

        let tracked = self.tracked.clone();
        let exit_observer = self.exit_observer.clone();
        let name = model.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            // Still tracked means nobody asked for this exit.
            let unexpected = {
                let mut tracked = tracked.lock().unwrap_or_else(|p| p.into_inner());
                if tracked.get(&name).map(|p| p.pid) == Some(pid) {
                    tracked.remove(&name)
                } else {
                    None
                }
            };
            match status {
                Ok(status) => info!(model = %name, pid, %status, "model process exited"),
                Err(e) => warn!(model = %name, pid, "waiting on model process failed: {e}"),
            }
            if let Some(record) = unexpected {
                let observer = exit_observer.lock().unwrap_or_else(|p| p.into_inner()).clone();
                if let Some(observer) = observer {
                    observer(&record);
                }
            }
        });

        Ok(record)
    }

    /// SIGTERM the model's process and forget it. `false` if not tracked.
    pub fn stop(&self, model: &str) -> bool {
        let Some(record) = self.lock().remove(model) else {
            return false;
        };
        if let Err(e) = send_signal(record.pid, Signal::Term) {
            debug!(model, pid = record.pid, "SIGTERM failed: {e}");
        }
        info!(model, pid = record.pid, "model process stopped");
        true
    }

    /// Stop everything; used at shutdown.
    pub fn stop_all(&self) {
        let names: Vec<String> = self.lock().keys().cloned().collect();
        for name in names {
            self.stop(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_binary_layout() {
        let path = resolve_binary(Path::new("/srv/llamaprox"), "llama-2-7b");
        let segments: Vec<_> = path.iter().map(|s| s.to_string_lossy().into_owned()).collect();
        for expected in ["data", "models", "llama-2-7b", "model.bin"] {
            assert!(segments.iter().any(|s| s == expected), "missing segment {expected}");
        }
        assert!(path.ends_with("data/models/llama-2-7b/model.bin"));
    }

    #[tokio::test]
    async fn binary_exists_false_on_enoent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!binary_exists(&dir.path().join("nope/model.bin")).await);
    }

    #[tokio::test]
    async fn binary_exists_true_for_file_false_for_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.bin");
        std::fs::write(&file, b"weights").unwrap();
        assert!(binary_exists(&file).await);
        assert!(!binary_exists(dir.path()).await);
    }

    #[tokio::test]
    async fn start_without_binary_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new("/bin/true", dir.path());
        let err = registry.start("llama-2-7b").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(registry.info("llama-2-7b").is_none());
    }

    #[tokio::test]
    async fn path_like_model_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new("/bin/true", dir.path());
        assert!(matches!(registry.start("../etc").await, Err(AppError::InvalidInput(_))));
        assert!(matches!(registry.start("").await, Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn find_executable_checks_path_and_files() {
        assert!(find_executable(Path::new("/nonexistent/llama-server")).is_none());
        assert!(find_executable(Path::new("definitely-not-a-binary-xyz")).is_none());
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("llama-server");
        std::fs::write(&exe, b"").unwrap();
        assert_eq!(find_executable(&exe), Some(exe));
    }

    #[test]
    fn stop_untracked_is_false() {
        let registry = ProcessRegistry::new("/bin/true", "/tmp");
        assert!(!registry.stop("ghost"));
    }

    #[cfg(unix)]
    fn script_model(root: &Path, model: &str, script: &str) {
        let binary = resolve_binary(root, model);
        std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
        // `sh -m <file> ...` runs the model file as a script.
        std::fs::write(&binary, script).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn natural_exit_is_reported_and_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        script_model(dir.path(), "short-lived", "exit 3\n");
        let registry = ProcessRegistry::new("/bin/sh", dir.path());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        registry.on_exit(move |p| {
            let _ = tx.send(p.clone());
        });

        let started = registry.start("short-lived").await.unwrap();
        let mut rx = rx;
        let exited = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("exit reported")
            .unwrap();
        assert_eq!(exited.pid, started.pid);
        assert_eq!(exited.model, "short-lived");
        assert!(registry.info("short-lived").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn requested_stop_is_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        script_model(dir.path(), "sleeper", "sleep 30\n");
        let registry = ProcessRegistry::new("/bin/sh", dir.path());
        let reported = Arc::new(Mutex::new(0u32));
        let counter = reported.clone();
        registry.on_exit(move |_| *counter.lock().unwrap() += 1);

        registry.start("sleeper").await.unwrap();
        assert!(registry.stop("sleeper"));
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(*reported.lock().unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_is_idempotent_and_stop_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let binary = resolve_binary(dir.path(), "sleeper");
        std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
        // `sh -m <file> ...` runs the model file as a script.
        std::fs::write(&binary, "sleep 30\n").unwrap();

        let registry = ProcessRegistry::new("/bin/sh", dir.path());
        let first = registry.start("sleeper").await.unwrap();
        let second = registry.start("sleeper").await.unwrap();
        assert_eq!(first.pid, second.pid);
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.info("sleeper").unwrap().model_path, binary);

        assert!(registry.stop("sleeper"));
        assert!(registry.info("sleeper").is_none());
        assert!(!registry.stop("sleeper"));
    }
}
