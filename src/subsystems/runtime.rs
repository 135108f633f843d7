//! Component runtime: long-running tasks that live beside the bus handlers.
//!
//! # Component model
//!
//! A [`Component`] is an independently-runnable unit such as the axum
//! channel or the metrics collector. It is constructed with its shared
//! state already captured, then handed to [`spawn_components`].
//!
//! # SubsystemHandle
//!
//! [`spawn_components`] returns a [`SubsystemHandle`] that the caller can
//! `.await` or hold while doing other work. Any component error cancels the
//! shared [`CancellationToken`] so siblings and the supervisor shut down.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures_util::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::AppError;

// ── Component ─────────────────────────────────────────────────────────────────

/// A boxed, owned future returned by [`Component::run`].
pub type ComponentFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'static>>;

/// A self-contained, concurrently-runnable unit.
///
/// [`Component::run`] is called once and should return when `shutdown` is
/// cancelled or the component's own work is done.
pub trait Component: Send + 'static {
    /// Stable identifier used in log messages.
    fn id(&self) -> &str;

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture;
}

// ── SubsystemHandle ───────────────────────────────────────────────────────────

/// Resolves once every spawned component has exited.
pub struct SubsystemHandle {
    inner: JoinHandle<Result<(), AppError>>,
}

impl SubsystemHandle {
    /// Await all components and return the first error, if any.
    pub async fn join(self) -> Result<(), AppError> {
        match self.inner.await {
            Ok(r) => r,
            Err(e) => Err(AppError::Comms(format!("component runtime panicked: {e}"))),
        }
    }
}

// ── spawn_components ──────────────────────────────────────────────────────────

/// Spawn each [`Component`] as its own Tokio task.
///
/// The first component to fail or panic cancels `shutdown`; its error,
/// tagged with the component id, is returned once the rest have drained.
pub fn spawn_components(
    components: Vec<Box<dyn Component>>,
    shutdown: CancellationToken,
) -> SubsystemHandle {
    let handle = tokio::spawn(async move {
        let mut set: JoinSet<(String, Result<(), AppError>)> = JoinSet::new();
        for component in components {
            let id = component.id().to_string();
            debug!(component = %id, "starting component");
            let run = AssertUnwindSafe(component.run(shutdown.clone())).catch_unwind();
            set.spawn(async move {
                let result = run.await.unwrap_or_else(|panic| {
                    Err(AppError::Comms(format!("panicked: {}", panic_message(&*panic))))
                });
                (id, result)
            });
        }

        let mut first_err: Option<AppError> = None;
        while let Some(joined) = set.join_next().await {
            let (id, result) = match joined {
                Ok(exit) => exit,
                // Only reachable if the runtime aborts the task.
                Err(e) => ("<unknown>".to_string(), Err(AppError::Comms(e.to_string()))),
            };
            match result {
                Ok(()) => info!(component = %id, "component stopped"),
                Err(e) => {
                    error!(component = %id, "component failed: {e}");
                    if !shutdown.is_cancelled() {
                        info!(component = %id, "cancelling remaining components");
                        shutdown.cancel();
                    }
                    first_err.get_or_insert(AppError::Comms(format!("{id}: {e}")));
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    });

    SubsystemHandle { inner: handle }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct UntilCancelled(&'static str);

    impl Component for UntilCancelled {
        fn id(&self) -> &str {
            self.0
        }

        fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
            Box::pin(async move {
                shutdown.cancelled().await;
                Ok(())
            })
        }
    }

    struct FailsAfter(Duration);

    impl Component for FailsAfter {
        fn id(&self) -> &str {
            "fails"
        }

        fn run(self: Box<Self>, _shutdown: CancellationToken) -> ComponentFuture {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                Err(AppError::Comms("bind failed".into()))
            })
        }
    }

    #[tokio::test]
    async fn cancel_stops_everything_cleanly() {
        let shutdown = CancellationToken::new();
        let handle = spawn_components(
            vec![Box::new(UntilCancelled("a")), Box::new(UntilCancelled("b"))],
            shutdown.clone(),
        );
        shutdown.cancel();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn one_failure_cancels_siblings() {
        let shutdown = CancellationToken::new();
        let handle = spawn_components(
            vec![
                Box::new(UntilCancelled("sibling")),
                Box::new(FailsAfter(Duration::from_millis(10))),
            ],
            shutdown.clone(),
        );
        let err = handle.join().await.unwrap_err();
        assert!(err.to_string().contains("bind failed"));
        assert!(err.to_string().contains("fails:"));
        assert!(shutdown.is_cancelled());
    }

    struct Panics;

    impl Component for Panics {
        fn id(&self) -> &str {
            "collector"
        }

        fn run(self: Box<Self>, _shutdown: CancellationToken) -> ComponentFuture {
            Box::pin(async move { panic!("sampler exploded") })
        }
    }

    #[tokio::test]
    async fn panic_is_reported_with_component_id() {
        let shutdown = CancellationToken::new();
        let handle = spawn_components(
            vec![Box::new(UntilCancelled("axum0")), Box::new(Panics)],
            shutdown.clone(),
        );
        let err = handle.join().await.unwrap_err().to_string();
        assert!(err.contains("collector"), "{err}");
        assert!(err.contains("sampler exploded"), "{err}");
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn empty_set_resolves() {
        spawn_components(Vec::new(), CancellationToken::new()).join().await.unwrap();
    }
}
