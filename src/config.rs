//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `LLAMAPROX_WORK_DIR`, `LLAMAPROX_LOG_LEVEL`,
//! `LLAMA_SERVER_HOST` and `LLAMA_SERVER_PORT` overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::subsystems::llama::start_budget;

/// Slack between the heavy bus timeout and the outer REST timeout.
const REST_TIMEOUT_MARGIN_SECS: u64 = 5;

/// HTTP / WebSocket listener configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Socket address for the REST + WebSocket listener.
    pub bind: String,
    /// Upgrade path for the realtime event channel.
    pub ws_path: String,
    /// Upper bound for a single REST call waiting on the bus.
    pub request_timeout_secs: u64,
}

/// Flash attention mode passed to llama-server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashAttn {
    On,
    Off,
    Auto,
}

/// Launch parameters for one llama-server instance.
///
/// Deserialised from `[llama.server]` and from `llama:start` payloads.
/// Unset optional fields are left out of the command line entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlamaServerConfig {
    #[serde(default = "default_llama_host")]
    pub host: String,
    #[serde(default = "default_llama_port")]
    pub port: u16,
    /// llama-server executable.
    #[serde(default = "default_server_path")]
    pub server_path: PathBuf,
    /// Single model to load (`-m`). Takes priority over `models_dir`.
    pub model_path: Option<PathBuf>,
    /// Directory of models for router mode and filesystem discovery.
    pub models_dir: Option<PathBuf>,

    pub ctx_size: Option<u32>,
    pub batch_size: Option<u32>,
    pub ubatch_size: Option<u32>,
    /// -1 lets llama-server pick.
    pub threads: Option<i32>,
    pub threads_batch: Option<i32>,
    /// -1 lets llama-server pick.
    pub gpu_layers: Option<i32>,
    pub main_gpu: Option<i32>,
    pub flash_attn: Option<FlashAttn>,

    // sampling
    pub temperature: Option<f64>,
    pub top_k: Option<i32>,
    pub top_p: Option<f64>,
    pub min_p: Option<f64>,
    pub typical_p: Option<f64>,
    pub repeat_last_n: Option<i32>,
    pub repeat_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub xtc_probability: Option<f64>,
    pub xtc_threshold: Option<f64>,
    pub dry_multiplier: Option<f64>,
    pub dry_base: Option<f64>,
    pub dry_allowed_length: Option<i32>,
    pub dry_penalty_last_n: Option<i32>,
    pub n_predict: Option<i32>,
    pub seed: Option<i64>,

    // rope / yarn
    pub rope_freq_base: Option<f64>,
    pub rope_freq_scale: Option<f64>,
    pub yarn_ext_factor: Option<f64>,
    pub yarn_attn_factor: Option<f64>,
    pub yarn_beta_fast: Option<f64>,
    pub yarn_beta_slow: Option<f64>,
    pub grp_attn_n: Option<i32>,
    pub grp_attn_w: Option<i32>,
    pub neg_prompt_multiplier: Option<f64>,

    pub cache_type_k: Option<String>,
    pub cache_type_v: Option<String>,
    /// `Some(false)` adds `--no-mmap`.
    pub use_mmap: Option<bool>,

    #[serde(default)]
    pub embedding: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub penalize_nl: bool,
    #[serde(default)]
    pub ignore_eos: bool,
    #[serde(default)]
    pub mlock: bool,
    #[serde(default)]
    pub numa: bool,
    #[serde(default)]
    pub memory_mapped: bool,
    #[serde(default)]
    pub no_kv_offload: bool,

    /// Extra arguments appended verbatim.
    #[serde(default)]
    pub server_args: Vec<String>,
}

impl LlamaServerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Supervision budgets plus the launch parameters.
#[derive(Debug, Clone)]
pub struct LlamaConfig {
    /// Start llama-server when the daemon boots.
    pub autostart: bool,
    pub max_retries: u32,
    /// Crash-restart delay is `retry_base_ms * 2^retries`.
    pub retry_base_ms: u64,
    pub max_health_checks: u32,
    pub health_check_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout_ms: u64,
    pub server: LlamaServerConfig,
}

/// Realtime channel limits and correlator timeouts.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub rate_limit_max_events: u32,
    pub rate_limit_window_ms: u64,
    /// Connections past `max_events * abuse_multiplier` in a window are closed.
    pub abuse_multiplier: u32,
    pub read_timeout_ms: u64,
    pub heavy_timeout_ms: u64,
    pub default_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub retention_minutes: u64,
}

/// Fully-resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    /// Working directory for all persistent data (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    pub http: HttpConfig,
    pub llama: LlamaConfig,
    pub realtime: RealtimeConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// SQLite database file inside the work dir.
    pub fn db_path(&self) -> PathBuf {
        self.work_dir.join("llamaprox.db")
    }
}

/// Environment-sourced overrides. Tests build this directly.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub work_dir: Option<String>,
    pub log_level: Option<String>,
    pub llama_host: Option<String>,
    pub llama_port: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self {
            work_dir: env::var("LLAMAPROX_WORK_DIR").ok(),
            log_level: env::var("LLAMAPROX_LOG_LEVEL").ok(),
            llama_host: env::var("LLAMA_SERVER_HOST").ok(),
            llama_port: env::var("LLAMA_SERVER_PORT").ok(),
        }
    }
}

/// Raw TOML shape, the `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    server: RawServer,
    #[serde(default)]
    http: RawHttp,
    #[serde(default)]
    llama: RawLlama,
    #[serde(default)]
    realtime: RawRealtime,
    #[serde(default)]
    metrics: RawMetrics,
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default = "default_name")]
    name: String,
    work_dir: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

#[derive(Deserialize)]
struct RawHttp {
    #[serde(default = "default_http_bind")]
    bind: String,
    #[serde(default = "default_ws_path")]
    ws_path: String,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
}

impl Default for RawHttp {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            ws_path: default_ws_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Deserialize)]
struct RawLlama {
    #[serde(default)]
    autostart: bool,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    retry_base_ms: u64,
    #[serde(default = "default_max_health_checks")]
    max_health_checks: u32,
    #[serde(default = "default_health_check_interval_ms")]
    health_check_interval_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    stop_timeout_ms: u64,
    #[serde(default = "default_server_config")]
    server: LlamaServerConfig,
}

impl Default for RawLlama {
    fn default() -> Self {
        Self {
            autostart: false,
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            max_health_checks: default_max_health_checks(),
            health_check_interval_ms: default_health_check_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            server: default_server_config(),
        }
    }
}

#[derive(Deserialize)]
struct RawRealtime {
    #[serde(default = "default_rate_limit_max_events")]
    rate_limit_max_events: u32,
    #[serde(default = "default_rate_limit_window_ms")]
    rate_limit_window_ms: u64,
    #[serde(default = "default_abuse_multiplier")]
    abuse_multiplier: u32,
    #[serde(default = "default_read_timeout_ms")]
    read_timeout_ms: u64,
    #[serde(default = "default_heavy_timeout_ms")]
    heavy_timeout_ms: u64,
    #[serde(default = "default_default_timeout_ms")]
    default_timeout_ms: u64,
}

impl Default for RawRealtime {
    fn default() -> Self {
        Self {
            rate_limit_max_events: default_rate_limit_max_events(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            abuse_multiplier: default_abuse_multiplier(),
            read_timeout_ms: default_read_timeout_ms(),
            heavy_timeout_ms: default_heavy_timeout_ms(),
            default_timeout_ms: default_default_timeout_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawMetrics {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_metrics_interval_ms")]
    interval_ms: u64,
    #[serde(default = "default_retention_minutes")]
    retention_minutes: u64,
}

impl Default for RawMetrics {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_metrics_interval_ms(),
            retention_minutes: default_retention_minutes(),
        }
    }
}

fn default_name() -> String { "llamaprox".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_http_bind() -> String { "127.0.0.1:3000".to_string() }
fn default_ws_path() -> String { "/llamaproxws".to_string() }
fn default_request_timeout_secs() -> u64 { 130 }
fn default_llama_host() -> String { "127.0.0.1".to_string() }
fn default_llama_port() -> u16 { 8134 }
fn default_server_path() -> PathBuf { PathBuf::from("llama-server") }
fn default_max_retries() -> u32 { 5 }
fn default_retry_base_ms() -> u64 { 1_000 }
fn default_max_health_checks() -> u32 { 18 }
fn default_health_check_interval_ms() -> u64 { 1_000 }
fn default_stop_timeout_ms() -> u64 { 5_000 }
fn default_rate_limit_max_events() -> u32 { 100 }
fn default_rate_limit_window_ms() -> u64 { 1_000 }
fn default_abuse_multiplier() -> u32 { 3 }
fn default_read_timeout_ms() -> u64 { 10_000 }
fn default_heavy_timeout_ms() -> u64 { 120_000 }
fn default_default_timeout_ms() -> u64 { 30_000 }
fn default_metrics_interval_ms() -> u64 { 10_000 }
fn default_retention_minutes() -> u64 { 10 }
fn default_true() -> bool { true }

fn default_server_config() -> LlamaServerConfig {
    LlamaServerConfig {
        host: default_llama_host(),
        port: default_llama_port(),
        server_path: default_server_path(),
        ..LlamaServerConfig::default()
    }
}

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, AppError> {
    load_from(Path::new("config/default.toml"), &Overrides::from_env())
}

/// Loader with an explicit path. Tests pass overrides directly instead of
/// mutating env vars.
pub fn load_from(path: &Path, overrides: &Overrides) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let s = parsed.server;
    let work_dir = expand_home(overrides.work_dir.as_deref().unwrap_or(&s.work_dir));
    let log_level = overrides.log_level.clone().unwrap_or(s.log_level);

    let mut server = parsed.llama.server;
    if let Some(host) = &overrides.llama_host {
        server.host = host.clone();
    }
    if let Some(port) = &overrides.llama_port {
        server.port = port
            .parse()
            .map_err(|_| AppError::Config(format!("LLAMA_SERVER_PORT is not a port: '{port}'")))?;
    }
    server.server_path = expand_path(&server.server_path);
    server.model_path = server.model_path.as_deref().map(expand_path);
    server.models_dir = server.models_dir.as_deref().map(expand_path);

    let realtime = parsed.realtime;
    if realtime.rate_limit_max_events == 0 {
        return Err(AppError::Config("realtime.rate_limit_max_events must be > 0".into()));
    }

    let llama = LlamaConfig {
        autostart: parsed.llama.autostart,
        max_retries: parsed.llama.max_retries,
        retry_base_ms: parsed.llama.retry_base_ms,
        max_health_checks: parsed.llama.max_health_checks,
        health_check_interval_ms: parsed.llama.health_check_interval_ms,
        stop_timeout_ms: parsed.llama.stop_timeout_ms,
        server,
    };
    // Heavy calls must outlast a worst-case start, and REST must outlast
    // the heavy class so the bus timeout is the one reported.
    let start_ms = u64::try_from(start_budget(&llama).as_millis()).unwrap_or(u64::MAX);
    let heavy_timeout_ms = realtime.heavy_timeout_ms.max(start_ms);
    let request_timeout_secs = parsed
        .http
        .request_timeout_secs
        .max(heavy_timeout_ms.div_ceil(1_000) + REST_TIMEOUT_MARGIN_SECS);

    Ok(Config {
        name: s.name,
        work_dir,
        log_level,
        http: HttpConfig {
            bind: parsed.http.bind,
            ws_path: parsed.http.ws_path,
            request_timeout_secs,
        },
        llama,
        realtime: RealtimeConfig {
            rate_limit_max_events: realtime.rate_limit_max_events,
            rate_limit_window_ms: realtime.rate_limit_window_ms,
            abuse_multiplier: realtime.abuse_multiplier.max(1),
            read_timeout_ms: realtime.read_timeout_ms,
            heavy_timeout_ms,
            default_timeout_ms: realtime.default_timeout_ms,
        },
        metrics: MetricsConfig {
            enabled: parsed.metrics.enabled,
            interval_ms: parsed.metrics.interval_ms,
            retention_minutes: parsed.metrics.retention_minutes,
        },
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => expand_home(s),
        None => path.to_path_buf(),
    }
}

// ── test helpers ──────────────────────────────────────────────────────────────

/// Config for unit tests: fast budgets, nothing bound to real ports.
#[cfg(test)]
impl Config {
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            name: "test".into(),
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            http: HttpConfig {
                bind: "127.0.0.1:0".into(),
                ws_path: default_ws_path(),
                request_timeout_secs: 5,
            },
            llama: LlamaConfig {
                autostart: false,
                max_retries: 2,
                retry_base_ms: 10,
                max_health_checks: 3,
                health_check_interval_ms: 10,
                stop_timeout_ms: 200,
                server: LlamaServerConfig {
                    host: "127.0.0.1".into(),
                    port: 9,
                    server_path: work_dir.join("missing-llama-server"),
                    ..LlamaServerConfig::default()
                },
            },
            realtime: RealtimeConfig {
                rate_limit_max_events: 10,
                rate_limit_window_ms: 1_000,
                abuse_multiplier: 3,
                read_timeout_ms: 500,
                heavy_timeout_ms: 2_000,
                default_timeout_ms: 1_000,
            },
            metrics: MetricsConfig {
                enabled: false,
                interval_ms: 1_000,
                retention_minutes: 10,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const MINIMAL_TOML: &str = r#"
[server]
work_dir = "~/.llamaprox"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), &Overrides::default()).unwrap();
        assert_eq!(cfg.name, "llamaprox");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.http.ws_path, "/llamaproxws");
        assert_eq!(cfg.llama.max_retries, 5);
        assert_eq!(cfg.llama.stop_timeout_ms, 5_000);
        assert_eq!(cfg.llama.server.host, "127.0.0.1");
        assert_eq!(cfg.llama.server.port, 8134);
        assert_eq!(cfg.metrics.retention_minutes, 10);
    }

    #[test]
    fn llama_server_section_parses() {
        let f = write_toml(
            r#"
[server]
work_dir = "/tmp/lp"

[llama]
autostart = true
max_retries = 3

[llama.server]
port = 9000
server_path = "/opt/llama/llama-server"
model_path = "/models/qwen.gguf"
ctx_size = 8192
gpu_layers = 99
flash_attn = "on"
use_mmap = false
server_args = ["--jinja"]
"#,
        );
        let cfg = load_from(f.path(), &Overrides::default()).unwrap();
        assert!(cfg.llama.autostart);
        assert_eq!(cfg.llama.max_retries, 3);
        let server = &cfg.llama.server;
        assert_eq!(server.host, "127.0.0.1");
        assert_eq!(server.port, 9000);
        assert_eq!(server.ctx_size, Some(8192));
        assert_eq!(server.flash_attn, Some(FlashAttn::On));
        assert_eq!(server.use_mmap, Some(false));
        assert_eq!(server.server_args, vec!["--jinja".to_string()]);
        assert_eq!(server.base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/.llamaprox");
        assert!(expanded.starts_with(&home));
        assert!(expanded.ends_with(".llamaprox"));
    }

    #[test]
    fn absolute_path_unchanged() {
        assert_eq!(expand_home("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn missing_file_errors() {
        let err = load_from(Path::new("/nonexistent/config.toml"), &Overrides::default())
            .unwrap_err();
        assert!(err.to_string().contains("config error"));
    }

    #[test]
    fn env_overrides_apply() {
        let f = write_toml(MINIMAL_TOML);
        let overrides = Overrides {
            work_dir: Some("/tmp/test-override".into()),
            log_level: Some("debug".into()),
            llama_host: Some("0.0.0.0".into()),
            llama_port: Some("8200".into()),
        };
        let cfg = load_from(f.path(), &overrides).unwrap();
        assert_eq!(cfg.work_dir, PathBuf::from("/tmp/test-override"));
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.llama.server.host, "0.0.0.0");
        assert_eq!(cfg.llama.server.port, 8200);
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/test-override/llamaprox.db"));
    }

    #[test]
    fn bad_port_override_is_config_error() {
        let f = write_toml(MINIMAL_TOML);
        let overrides = Overrides {
            llama_port: Some("eighty".into()),
            ..Overrides::default()
        };
        let err = load_from(f.path(), &overrides).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn zero_rate_limit_rejected() {
        let f = write_toml(
            r#"
[server]
work_dir = "/tmp/lp"

[realtime]
rate_limit_max_events = 0
"#,
        );
        assert!(load_from(f.path(), &Overrides::default()).is_err());
    }

    #[test]
    fn shipped_default_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let cfg = load_from(&path, &Overrides::default()).unwrap();
        assert_eq!(cfg.name, "llamaprox");
        assert_eq!(cfg.http.bind, "127.0.0.1:3000");
        assert_eq!(cfg.realtime.rate_limit_max_events, 100);
        assert!(cfg.metrics.enabled);
        assert!(!cfg.llama.autostart);
        // shipped budgets fit the nominal heavy class without raising it
        assert_eq!(cfg.realtime.heavy_timeout_ms, 120_000);
        assert!(start_budget(&cfg.llama) <= Duration::from_millis(cfg.realtime.heavy_timeout_ms));
        assert!(cfg.http.request_timeout_secs * 1_000 > cfg.realtime.heavy_timeout_ms);
    }

    #[test]
    fn heavy_timeout_covers_slow_starts() {
        let f = write_toml(
            r#"
[server]
work_dir = "/tmp/lp"

[http]
request_timeout_secs = 10

[llama]
max_health_checks = 60
health_check_interval_ms = 2000
stop_timeout_ms = 10000

[realtime]
heavy_timeout_ms = 30000
"#,
        );
        let cfg = load_from(f.path(), &Overrides::default()).unwrap();
        let budget = start_budget(&cfg.llama);
        assert!(budget > Duration::from_secs(300));
        assert!(Duration::from_millis(cfg.realtime.heavy_timeout_ms) >= budget);
        assert!(cfg.http.request_timeout_secs * 1_000 > cfg.realtime.heavy_timeout_ms);
    }
}
