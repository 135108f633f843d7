//! `llamaprox-ctl`: command-line client for the llamaprox daemon.
//!
//! Connects to the realtime WebSocket channel, sends one request and prints
//! the JSON result. `watch` streams server pushes until interrupted.
//!
//! # Usage
//!
//! ```text
//! llamaprox-ctl [--url <ws-url>] <command> [args]
//! ```
//!
//! URL resolution order:
//!   1. `--url <ws-url>` flag
//!   2. `$LLAMAPROX_URL`
//!   3. `ws://127.0.0.1:3000/llamaproxws`

use std::process;

use serde_json::{Value, json};

use llamaprox::client::RealtimeClient;
use llamaprox::subsystems::comms::correlator::Timeouts;

const DEFAULT_URL: &str = "ws://127.0.0.1:3000/llamaproxws";

// ── CLI arg parsing ────────────────────────────────────────────────────────

struct Args {
    url: Option<String>,
    command: Option<String>,
    rest: Vec<String>,
}

fn parse_args() -> Args {
    let mut url = None;
    let mut command = None;
    let mut rest = Vec::new();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--url" | "-u" => url = iter.next(),
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--" => {
                rest.extend(iter);
                break;
            }
            _ if command.is_none() => command = Some(arg),
            _ => rest.push(arg),
        }
    }

    Args { url, command, rest }
}

fn print_help() {
    eprintln!("usage: llamaprox-ctl [--url <ws-url>] <command> [args]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  status                    llama-server state");
    eprintln!("  start | stop | restart    control llama-server");
    eprintln!("  models                    list stored models");
    eprintln!("  scan                      import models from the models dir");
    eprintln!("  run <model>               start a registry model process");
    eprintln!("  kill <model>              stop a registry model process");
    eprintln!("  config <model-id> [type]  show model configuration");
    eprintln!("  settings                  show global settings");
    eprintln!("  metrics [minutes]         latest sample, or history");
    eprintln!("  logs [limit]              recent log entries");
    eprintln!("  call <event> [json]       send any event");
    eprintln!("  watch                     stream server pushes");
    eprintln!();
    eprintln!("flags:");
    eprintln!("  --url, -u <ws-url>   override the daemon url");
    eprintln!("  --help, -h           print this help");
}

fn resolve_url(override_url: Option<String>) -> String {
    override_url
        .or_else(|| std::env::var("LLAMAPROX_URL").ok().filter(|u| !u.is_empty()))
        .unwrap_or_else(|| DEFAULT_URL.to_string())
}

enum Command {
    Request { event: String, data: Value },
    Watch,
}

fn build_command(cmd: &str, rest: &[String]) -> Result<Command, String> {
    let request = |event: &str, data: Value| Ok(Command::Request { event: event.to_string(), data });
    let number = |s: &str, what: &str| s.parse::<i64>().map_err(|_| format!("{what} must be a number: '{s}'"));

    match cmd {
        "status" => request("llama:status", Value::Null),
        "start" => request("llama:start", Value::Null),
        "stop" => request("llama:stop", Value::Null),
        "restart" => request("llama:restart", Value::Null),
        "models" => request("models:list", Value::Null),
        "scan" => request("models:scan", Value::Null),
        "run" | "kill" => {
            let model = rest.first().ok_or(format!("usage: llamaprox-ctl {cmd} <model>"))?;
            let event = if cmd == "run" { "models:start" } else { "models:stop" };
            request(event, json!({ "model": model }))
        }
        "config" => {
            let id = rest.first().ok_or("usage: llamaprox-ctl config <model-id> [type]")?;
            let mut data = json!({ "modelId": number(id, "model id")? });
            if let Some(category) = rest.get(1) {
                data["type"] = json!(category);
            }
            request("config:get", data)
        }
        "settings" => request("settings:get", Value::Null),
        "metrics" => match rest.first() {
            Some(m) => request("metrics:history", json!({ "minutes": number(m, "minutes")? })),
            None => request("metrics:get", Value::Null),
        },
        "logs" => match rest.first() {
            Some(l) => request("logs:get", json!({ "limit": number(l, "limit")? })),
            None => request("logs:get", Value::Null),
        },
        "call" => {
            let event = rest.first().ok_or("usage: llamaprox-ctl call <event> [json]")?;
            let data = match rest.get(1) {
                Some(raw) => serde_json::from_str(raw).map_err(|e| format!("bad json payload: {e}"))?,
                None => Value::Null,
            };
            request(event, data)
        }
        "watch" => Ok(Command::Watch),
        other => Err(format!("unknown command: {other}\n  run 'llamaprox-ctl --help' for usage")),
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = parse_args();

    let Some(cmd_str) = args.command else {
        eprintln!("error: no command given");
        eprintln!("  run 'llamaprox-ctl --help' for usage");
        process::exit(1);
    };

    let cmd = match build_command(&cmd_str, &args.rest) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(&resolve_url(args.url), cmd).await {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn run(url: &str, cmd: Command) -> Result<(), String> {
    let client = RealtimeClient::connect(url, Timeouts::default())
        .await
        .map_err(|e| format!("{e}\n  is the daemon running?"))?;

    match cmd {
        Command::Request { event, data } => {
            let result = client.request(&event, data).await.map_err(|e| e.to_string())?;
            let pretty = serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?;
            println!("{pretty}");
        }
        Command::Watch => {
            let mut rx = client.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    frame = rx.recv() => match frame {
                        Ok(frame) => println!("{} {}", frame.event, frame.data),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            eprintln!("(skipped {n} events)");
                        }
                        Err(_) => return Err("connection closed".to_string()),
                    },
                }
            }
        }
    }
    Ok(())
}
