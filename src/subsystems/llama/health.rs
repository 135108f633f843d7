//! Health probing of a running llama-server (`GET /health`).

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, trace};

use crate::error::AppError;

/// Per-request timeout shared by health checks and model listing.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// A single `/health` probe; llama-server answers 503 quickly while loading.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for the growing interval between readiness polls.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

fn next_wait(wait: Duration, interval: Duration) -> Duration {
    (wait + wait / 2).min(MAX_POLL_INTERVAL.max(interval))
}

/// Worst-case wall time of [`HealthChecker::wait_for_ready`]: every probe
/// times out and every sleep runs.
pub fn wait_budget(max_checks: u32, interval: Duration) -> Duration {
    let mut total = Duration::ZERO;
    let mut wait = interval;
    for attempt in 1..=max_checks {
        total += HEALTH_PROBE_TIMEOUT;
        if attempt < max_checks {
            total += wait;
            wait = next_wait(wait, interval);
        }
    }
    total
}

/// Build the client used for every backend call.
pub fn http_client() -> Result<Client, AppError> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| AppError::Llama(format!("failed to build HTTP client: {e}")))
}

/// Cheap to clone; `reqwest::Client` is an `Arc` internally.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
    base_url: String,
}

impl HealthChecker {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }

    /// `true` only for a 200 answer. Transport errors count as unhealthy.
    pub async fn check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).timeout(HEALTH_PROBE_TIMEOUT).send().await {
            Ok(resp) => {
                trace!(status = %resp.status(), "health probe");
                resp.status() == StatusCode::OK
            }
            Err(e) => {
                trace!("health probe failed: {e}");
                false
            }
        }
    }

    /// Poll until healthy, up to `max_checks` attempts. The wait between
    /// attempts starts at `interval` and grows by half each time, capped at
    /// five seconds.
    pub async fn wait_for_ready(&self, max_checks: u32, interval: Duration) -> Result<(), AppError> {
        let mut wait = interval;
        for attempt in 1..=max_checks {
            if self.check().await {
                debug!(attempt, "llama-server healthy");
                return Ok(());
            }
            if attempt < max_checks {
                tokio::time::sleep(wait).await;
                wait = next_wait(wait, interval);
            }
        }
        Err(AppError::Llama(format!(
            "llama-server did not respond after {max_checks} health checks"
        )))
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Throwaway HTTP server standing in for llama-server.

    use axum::{Json, Router, http::StatusCode, routing::get};
    use serde_json::Value;
    use tokio::net::TcpListener;

    /// Serve `/health` with `health` and `/models` with `models`.
    /// Returns the base URL and the bound port.
    pub async fn spawn(health: StatusCode, models: Value) -> (String, u16) {
        let router = Router::new()
            .route("/health", get(move || async move { health }))
            .route("/models", get(move || async move { Json(models) }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        (format!("http://127.0.0.1:{port}"), port)
    }

    /// A port with nothing listening on it.
    pub async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use serde_json::json;

    #[tokio::test]
    async fn healthy_server_is_ok() {
        let (url, _) = test_server::spawn(AxumStatus::OK, json!([])).await;
        let checker = HealthChecker::new(http_client().unwrap(), url);
        assert!(checker.check().await);
        assert!(checker.wait_for_ready(1, Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn non_200_is_unhealthy() {
        let (url, _) = test_server::spawn(AxumStatus::SERVICE_UNAVAILABLE, json!([])).await;
        let checker = HealthChecker::new(http_client().unwrap(), url);
        assert!(!checker.check().await);
    }

    #[test]
    fn wait_budget_counts_probes_and_sleeps() {
        assert_eq!(wait_budget(1, Duration::from_millis(10)), HEALTH_PROBE_TIMEOUT);
        // probes 3 x 1s, sleeps 1s + 1.5s
        assert_eq!(wait_budget(3, Duration::from_secs(1)), Duration::from_millis(5_500));
        // sleeps settle at the 5s cap
        let longer = wait_budget(12, Duration::from_secs(1)) - wait_budget(11, Duration::from_secs(1));
        assert_eq!(longer, HEALTH_PROBE_TIMEOUT + MAX_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn unreachable_exhausts_budget() {
        let port = test_server::dead_port().await;
        let checker = HealthChecker::new(http_client().unwrap(), format!("http://127.0.0.1:{port}"));
        let err = checker.wait_for_ready(3, Duration::from_millis(5)).await.unwrap_err();
        assert!(err.to_string().contains("after 3 health checks"));
    }
}
