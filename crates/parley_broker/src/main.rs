//! Broker binary: lifespan + a newline-delimited JSON stdio binding.
//!
//! Each stdin line is `{"id": ..., "op": "...", "params": {...}}`; each
//! response line echoes the id with either a result or an error document.

use anyhow::Result;
use clap::Parser;
use parley_broker::bindings;
use parley_broker::broker::{BrokerOptions, BrokerRuntime};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "parley-broker", about = "Review broker for proposer/reviewer pairing")]
struct Cli {
    /// Override the store path (default: user config dir, or BROKER_DB_PATH)
    #[arg(long, env = "BROKER_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Override the pool config path (default: <repo>/.planning/config.json)
    #[arg(long, env = "BROKER_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// Override git repo root discovery
    #[arg(long, env = "BROKER_REPO_ROOT")]
    repo_root: Option<PathBuf>,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    parley_logging::init_logging(parley_logging::LogConfig {
        app_name: "parley-broker",
        verbose: cli.verbose,
    })?;

    let runtime = BrokerRuntime::start(BrokerOptions {
        db_path: cli.db_path,
        config_path: cli.config_path,
        repo_root: cli.repo_root,
    })
    .await?;

    serve_stdio(&runtime).await?;
    runtime.shutdown().await;
    Ok(())
}

/// Serve operations over stdin/stdout until EOF.
async fn serve_stdio(runtime: &BrokerRuntime) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(runtime, &line).await;
        stdout.write_all(response.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    info!("stdin closed, shutting down");
    Ok(())
}

async fn handle_line(runtime: &BrokerRuntime, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => return json!({ "error": format!("Malformed request: {err}") }),
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(op) = request.get("op").and_then(Value::as_str) else {
        return json!({ "id": id, "error": "Missing 'op' field" });
    };
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));
    let result = bindings::dispatch(&runtime.broker, op, params).await;
    json!({ "id": id, "result": result })
}
