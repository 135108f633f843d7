//! GPU stats from `nvidia-smi`. Every failure reads as zeros.

use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

const QUERY: &str =
    "--query-gpu=utilization.gpu,temperature.gpu,memory.used,memory.total,power.draw";
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpuStats {
    pub usage: f64,
    pub temperature: f64,
    /// MiB
    pub memory_used: f64,
    /// MiB
    pub memory_total: f64,
    /// Watts
    pub power: f64,
}

/// Parse the first GPU line of `--format=csv,noheader,nounits` output.
/// Fields reported as `[N/A]` read as zero.
pub fn parse_nvidia_smi(stdout: &str) -> Option<GpuStats> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let fields: Vec<f64> = line
        .split(',')
        .map(|f| f.trim().parse::<f64>().unwrap_or(0.0))
        .collect();
    if fields.len() < 5 {
        return None;
    }
    Some(GpuStats {
        usage: fields[0],
        temperature: fields[1],
        memory_used: fields[2],
        memory_total: fields[3],
        power: fields[4],
    })
}

pub async fn query() -> GpuStats {
    let run = Command::new("nvidia-smi")
        .args([QUERY, "--format=csv,noheader,nounits"])
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(QUERY_TIMEOUT, run).await {
        Ok(Ok(out)) if out.status.success() => {
            parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)).unwrap_or_default()
        }
        Ok(Ok(out)) => {
            debug!(status = %out.status, "nvidia-smi failed");
            GpuStats::default()
        }
        Ok(Err(e)) => {
            debug!("nvidia-smi unavailable: {e}");
            GpuStats::default()
        }
        Err(_) => {
            debug!("nvidia-smi timed out");
            GpuStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_gpu() {
        let out = "37, 61, 5120, 24576, 182.40\n3, 40, 100, 24576, 20.1\n";
        let stats = parse_nvidia_smi(out).unwrap();
        assert_eq!(stats.usage, 37.0);
        assert_eq!(stats.memory_total, 24576.0);
        assert_eq!(stats.power, 182.4);
    }

    #[test]
    fn not_available_fields_are_zero() {
        let stats = parse_nvidia_smi("12, 50, 800, 8192, [N/A]").unwrap();
        assert_eq!(stats.power, 0.0);
        assert_eq!(stats.memory_used, 800.0);
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("No devices were found").is_none());
    }
}
