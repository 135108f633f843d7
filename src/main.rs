//! llamaprox daemon entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Open the store and build the shared services
//!   6. Start the supervisor bus and its run-loop
//!   7. Spawn the signal watcher
//!   8. Run components (axum channel, metrics collector) until shutdown
//!   9. Stop llama-server and registry processes, join the supervisor

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use llamaprox::config::{self, Config, Overrides};
use llamaprox::error::AppError;
use llamaprox::logger;
use llamaprox::subsystems::runtime::{Component, spawn_components};
use llamaprox::subsystems::store::Store;
use llamaprox::subsystems::{Services, bus_handlers, comms};
use llamaprox::supervisor::{self, bus::SupervisorBus};

const DEFAULT_CONFIG: &str = "config/default.toml";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Optional file.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config_path = args.config_path.as_deref().unwrap_or(DEFAULT_CONFIG);
    let config = config::load_from(Path::new(config_path), &Overrides::from_env())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    logger::init(effective_log_level, args.log_level.is_some())?;

    info!(
        name = %config.name,
        work_dir = %config.work_dir.display(),
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    std::fs::create_dir_all(&config.work_dir)?;
    let store = Store::open(config.db_path())?;
    let services = Services::new(&config, store)?;

    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());

    let bus = SupervisorBus::new(64);
    let bus_handle = bus.handle.clone();
    let handlers = bus_handlers(&services);
    let handler_names: Vec<String> = handlers.iter().map(|h| h.prefix().to_string()).collect();

    let sup_token = shutdown.clone();
    let sup_handle = tokio::spawn(async move {
        supervisor::run(bus, sup_token, handlers).await;
    });

    let comms_state = comms::new_state(bus_handle, services.events.clone(), &config.realtime);

    let mut components: Vec<Box<dyn Component>> = vec![Box::new(comms::AxumChannel::new(
        "axum0",
        config.name.clone(),
        &config.http,
        comms_state.clone(),
    ))];

    #[cfg(feature = "subsystem-metrics")]
    if config.metrics.enabled {
        components.push(Box::new(llamaprox::subsystems::metrics::collector::MetricsCollector::new(
            &config.metrics,
            services.store.clone(),
            services.llama.clone(),
            services.registry.clone(),
            comms_state,
        )));
    }
    #[cfg(not(feature = "subsystem-metrics"))]
    drop(comms_state);

    print_startup_summary(&config, &handler_names, args.autostart || config.llama.autostart);

    if args.autostart || config.llama.autostart {
        let llama = services.llama.clone();
        tokio::spawn(async move {
            if let Err(e) = llama.launch().await {
                error!("llama-server autostart failed: {e}");
            }
        });
    }

    let result = spawn_components(components, shutdown.clone()).join().await;

    // Components can exit on their own (bind failure); stop everything else.
    shutdown.cancel();

    if let Err(e) = services.llama.stop().await {
        warn!("llama-server stop failed: {e}");
    }
    services.registry.stop_all();

    sup_handle.await.ok();
    info!("shutdown complete");

    result
}

fn spawn_signal_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("ctrl-c received, shutting down"),
                        _ = term.recv() => info!("SIGTERM received, shutting down"),
                    }
                }
                Err(e) => {
                    warn!("cannot install SIGTERM handler: {e}");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("ctrl-c received, shutting down");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
        }
        shutdown.cancel();
    });
}

fn print_startup_summary(config: &Config, handlers: &[String], autostart: bool) {
    let fit = |text: String| -> String {
        const WIDTH: usize = 58;
        if text.chars().count() >= WIDTH {
            let mut out = text.chars().take(WIDTH - 1).collect::<String>();
            out.push('…');
            out
        } else {
            format!("{text:<WIDTH$}")
        }
    };

    let mut handlers = handlers.to_vec();
    handlers.sort();
    let server = &config.llama.server;
    let model = server
        .model_path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ llamaprox {:<51}║", env!("CARGO_PKG_VERSION"));
    println!("╟──────────────────────────────────────────────────────────────╢");
    println!("║   {}║", fit(format!("name: {}  pid: {}", config.name, std::process::id())));
    println!("║   {}║", fit(format!("db: {}", config.db_path().display())));
    println!("║   {}║", fit(format!("handlers: {}", handlers.join(", "))));
    println!("╟──────────────────────────────────────────────────────────────╢");
    println!("║   {}║", fit(format!("http: {}  ws: {}", config.http.bind, config.http.ws_path)));
    println!("║   {}║", fit(format!("llama: {}  autostart: {autostart}", server.base_url())));
    println!("║   {}║", fit(format!("model: {model}")));
    println!(
        "║   {}║",
        fit(format!(
            "metrics: {}",
            if config.metrics.enabled { format!("every {}ms", config.metrics.interval_ms) } else { "disabled".into() }
        ))
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
}

struct CliArgs {
    log_level: Option<&'static str>,
    autostart: bool,
    config_path: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut autostart = false;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: llamaprox [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: {DEFAULT_CONFIG})");
                println!("      --autostart            Start llama-server at boot");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "--autostart" => autostart = true,
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            other => eprintln!("warning: ignoring unknown argument '{other}'"),
        }
    }

    //   -v → warn, -vv → info, -vvv → debug, -vvvv+ → trace
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    CliArgs { log_level, autostart, config_path }
}
