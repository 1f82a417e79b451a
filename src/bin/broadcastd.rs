//! broadcastd — run a broadcast-rs task server.

use std::path::PathBuf;
use std::time::Duration;

use broadcast_rs::config::Options;
use broadcast_rs::telemetry::{TelemetryConfig, init_telemetry};
use broadcast_rs::{Notify, Server, SubmitOptions, TaskError};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Parser)]
#[command(name = "broadcastd", about = "Background task server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server until Ctrl-C
    Serve {
        /// TOML config file (otherwise read from the environment)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the server name
        #[arg(long)]
        server_name: Option<String>,
        /// Override the heartbeat interval, in milliseconds
        #[arg(long)]
        heartbeat_ms: Option<u64>,
        /// Submit a recurring `ping` with this interval, in milliseconds
        #[arg(long)]
        ping_ms: Option<u64>,
    },
}

/// Result of the demo `ping` function.
#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    server: String,
    at: chrono::DateTime<chrono::Utc>,
}

impl Notify for Pong {
    const KIND: &'static str = "pong";
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            server_name,
            heartbeat_ms,
            ping_ms,
        } => cmd_serve(config, server_name, heartbeat_ms, ping_ms).await,
    }
}

async fn cmd_serve(
    config: Option<PathBuf>,
    server_name: Option<String>,
    heartbeat_ms: Option<u64>,
    ping_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut options = match config {
        Some(path) => Options::from_file(&path)?,
        None => Options::from_env()?,
    };
    if let Some(name) = server_name {
        options = options.with_server_name(name);
    }
    if let Some(ms) = heartbeat_ms {
        options = options.with_heartbeat_interval(Duration::from_millis(ms));
    }
    options.validate()?;

    let _guard = init_telemetry(TelemetryConfig::from_options(&options))?;

    let server_id = options.server_name.clone();
    let server = Server::builder(options)
        .function("log", |message: String| {
            info!(%message, "log task");
            Ok(())
        })
        .notifying_function("ping", move |_: serde_json::Value| {
            Ok::<_, TaskError>(Pong {
                server: server_id.clone(),
                at: chrono::Utc::now(),
            })
        })
        .handler(|pong: Pong| {
            info!(server = %pong.server, at = %pong.at, "pong");
            Ok(())
        })
        .start()?;

    if let Some(ms) = ping_ms {
        let id = server.submit(
            "ping",
            serde_json::Value::Null,
            SubmitOptions::new()
                .interval(Duration::from_millis(ms))
                .name("ping"),
        )?;
        info!(%id, interval_ms = ms, "recurring ping submitted");
    }

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received");
    server.shutdown().await;

    let processed = server.processed_tasks()?.len();
    info!(processed, "server stopped");
    Ok(())
}
