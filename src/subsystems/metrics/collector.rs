//! Periodic system sampler: CPU, memory and disk from `sysinfo`, GPU from
//! `nvidia-smi`. Each sample is persisted (pruning past the retention
//! window) and broadcast as `metrics:update`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::gpu;
use crate::config::MetricsConfig;
use crate::error::AppError;
use crate::subsystems::comms::CommsState;
use crate::subsystems::comms::protocol::EVENT_METRICS_UPDATE;
use crate::subsystems::llama::LlamaService;
use crate::subsystems::llama::process::ProcessRegistry;
use crate::subsystems::runtime::{Component, ComponentFuture};
use crate::subsystems::store::{MetricsSample, Store};

/// Host-level readings, all percentages.
struct HostSampler {
    sys: System,
}

impl HostSampler {
    fn new() -> Self {
        let mut sys = System::new();
        // first CPU reading needs a baseline
        sys.refresh_cpu_usage();
        Self { sys }
    }

    fn sample(&mut self) -> (f64, f64, f64) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let cpu = f64::from(self.sys.global_cpu_usage());
        let memory = percent(self.sys.used_memory(), self.sys.total_memory());

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));
        let disk = percent(total.saturating_sub(available), total);
        (cpu, memory, disk)
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 100.0 * 100.0).round() / 100.0
    }
}

pub struct MetricsCollector {
    store: Store,
    llama: LlamaService,
    registry: ProcessRegistry,
    comms: Arc<CommsState>,
    interval: Duration,
    retention: Duration,
}

impl MetricsCollector {
    pub fn new(
        config: &MetricsConfig,
        store: Store,
        llama: LlamaService,
        registry: ProcessRegistry,
        comms: Arc<CommsState>,
    ) -> Self {
        Self {
            store,
            llama,
            registry,
            comms,
            interval: Duration::from_millis(config.interval_ms.max(100)),
            retention: Duration::from_secs(config.retention_minutes.max(1) * 60),
        }
    }

    async fn collect(&self, host: &mut HostSampler) -> MetricsSample {
        let (cpu_usage, memory_usage, disk_usage) = host.sample();
        let gpu = gpu::query().await;
        let state = self.llama.state();
        MetricsSample {
            timestamp: chrono::Utc::now().timestamp_millis(),
            cpu_usage,
            memory_usage,
            disk_usage,
            gpu_usage: gpu.usage,
            gpu_temperature: gpu.temperature,
            gpu_memory_used: gpu.memory_used,
            gpu_memory_total: gpu.memory_total,
            gpu_power_usage: gpu.power,
            active_models: (state.models.len() + self.registry.list().len()) as i64,
            uptime: state.uptime as i64,
            requests_per_minute: self.comms.requests_per_minute() as f64,
        }
    }

    async fn run_loop(self, shutdown: CancellationToken) -> Result<(), AppError> {
        info!(interval_ms = self.interval.as_millis() as u64, "metrics collector started");
        let mut host = HostSampler::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sample = self.collect(&mut host).await;
            let store = self.store.clone();
            let retention = self.retention;
            let row = sample.clone();
            match tokio::task::spawn_blocking(move || store.insert_metrics(&row, retention)).await {
                Ok(Ok(pruned)) if pruned > 0 => debug!(pruned, "old metrics pruned"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("metrics not persisted: {e}"),
                Err(e) => warn!("metrics task failed: {e}"),
            }
            self.comms
                .broadcaster()
                .emit(EVENT_METRICS_UPDATE, json!({ "metrics": sample }));
        }

        info!("metrics collector stopped");
        Ok(())
    }
}

impl Component for MetricsCollector {
    fn id(&self) -> &str {
        "metrics"
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(self.run_loop(shutdown))
    }
}
