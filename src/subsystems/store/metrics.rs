//! Metrics history with a rolling retention window.

use std::time::Duration;

use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use super::{Store, now_ms, store_err};
use crate::error::AppError;

/// One system sample. `timestamp` is unix milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    pub timestamp: i64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub gpu_usage: f64,
    pub gpu_temperature: f64,
    /// MiB
    pub gpu_memory_used: f64,
    /// MiB
    pub gpu_memory_total: f64,
    /// Watts
    pub gpu_power_usage: f64,
    pub active_models: i64,
    /// Seconds.
    pub uptime: i64,
    pub requests_per_minute: f64,
}

const SELECT_COLUMNS: &str = "SELECT timestamp, cpu_usage, memory_usage, disk_usage, gpu_usage, \
     gpu_temperature, gpu_memory_used, gpu_memory_total, gpu_power_usage, active_models, uptime, \
     requests_per_minute FROM metrics_history";

fn map_row(row: &Row<'_>) -> rusqlite::Result<MetricsSample> {
    Ok(MetricsSample {
        timestamp: row.get(0)?,
        cpu_usage: row.get(1)?,
        memory_usage: row.get(2)?,
        disk_usage: row.get(3)?,
        gpu_usage: row.get(4)?,
        gpu_temperature: row.get(5)?,
        gpu_memory_used: row.get(6)?,
        gpu_memory_total: row.get(7)?,
        gpu_power_usage: row.get(8)?,
        active_models: row.get(9)?,
        uptime: row.get(10)?,
        requests_per_minute: row.get(11)?,
    })
}

fn cutoff(now: i64, window: Duration) -> i64 {
    now.saturating_sub(i64::try_from(window.as_millis()).unwrap_or(i64::MAX))
}

impl Store {
    /// Persist `sample` and drop rows older than `retention`. Returns the
    /// number of pruned rows.
    pub fn insert_metrics(&self, sample: &MetricsSample, retention: Duration) -> Result<usize, AppError> {
        let now = now_ms();
        let mut conn = self.open_conn()?;
        let tx = conn.transaction().map_err(store_err("begin metrics tx"))?;
        tx.execute(
            "INSERT INTO metrics_history (timestamp, cpu_usage, memory_usage, disk_usage, gpu_usage,
             gpu_temperature, gpu_memory_used, gpu_memory_total, gpu_power_usage, active_models,
             uptime, requests_per_minute, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                sample.timestamp,
                sample.cpu_usage,
                sample.memory_usage,
                sample.disk_usage,
                sample.gpu_usage,
                sample.gpu_temperature,
                sample.gpu_memory_used,
                sample.gpu_memory_total,
                sample.gpu_power_usage,
                sample.active_models,
                sample.uptime,
                sample.requests_per_minute,
                now,
            ],
        )
        .map_err(store_err("insert metrics"))?;
        let pruned = tx
            .execute(
                "DELETE FROM metrics_history WHERE timestamp < ?1",
                params![cutoff(now, retention)],
            )
            .map_err(store_err("prune metrics"))?;
        tx.commit().map_err(store_err("commit metrics tx"))?;
        Ok(pruned)
    }

    pub fn latest_metrics(&self) -> Result<Option<MetricsSample>, AppError> {
        let conn = self.open_conn()?;
        conn.query_row(
            &format!("{SELECT_COLUMNS} ORDER BY timestamp DESC, id DESC LIMIT 1"),
            [],
            map_row,
        )
        .optional()
        .map_err(store_err("latest_metrics"))
    }

    /// Samples from the last `window`, oldest first.
    pub fn metrics_history(&self, window: Duration) -> Result<Vec<MetricsSample>, AppError> {
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare(&format!("{SELECT_COLUMNS} WHERE timestamp >= ?1 ORDER BY timestamp ASC, id ASC"))
            .map_err(store_err("prepare metrics_history"))?;
        let rows = stmt
            .query_map(params![cutoff(now_ms(), window)], map_row)
            .map_err(store_err("query metrics_history"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(store_err("map metrics_history row"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::store::temp_store;

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn sample(age: Duration, cpu: f64) -> MetricsSample {
        MetricsSample {
            timestamp: now_ms() - age.as_millis() as i64,
            cpu_usage: cpu,
            ..Default::default()
        }
    }

    #[test]
    fn insert_prunes_outside_retention() {
        let (_dir, store) = temp_store();
        // lands, then is pruned by the next insert's sweep
        store.insert_metrics(&sample(Duration::from_secs(900), 1.0), Duration::from_secs(3600)).unwrap();
        let pruned = store.insert_metrics(&sample(Duration::ZERO, 2.0), TEN_MINUTES).unwrap();
        assert_eq!(pruned, 1);

        let history = store.metrics_history(TEN_MINUTES).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].cpu_usage, 2.0);
    }

    #[test]
    fn latest_and_windowed_history() {
        let (_dir, store) = temp_store();
        assert!(store.latest_metrics().unwrap().is_none());

        store.insert_metrics(&sample(Duration::from_secs(240), 10.0), TEN_MINUTES).unwrap();
        store.insert_metrics(&sample(Duration::from_secs(60), 20.0), TEN_MINUTES).unwrap();
        store.insert_metrics(&sample(Duration::ZERO, 30.0), TEN_MINUTES).unwrap();

        assert_eq!(store.latest_metrics().unwrap().unwrap().cpu_usage, 30.0);
        let last_two_minutes: Vec<f64> = store
            .metrics_history(Duration::from_secs(120))
            .unwrap()
            .iter()
            .map(|s| s.cpu_usage)
            .collect();
        assert_eq!(last_two_minutes, vec![20.0, 30.0]);
        assert_eq!(store.metrics_history(TEN_MINUTES).unwrap().len(), 3);
    }
}
