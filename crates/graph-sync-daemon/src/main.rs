//! graph-sync-daemon: headless client for a collaboratively edited room graph.
//!
//! Runs one sync session against the persisted store's REST API and the
//! realtime relay, reading JSON-lines commands on stdin and writing replies
//! and session events on stdout. With `--relay-listen` it runs a relay
//! instead.

use anyhow::{Context, Result};
use clap::Parser;
use graph_sync::{LoopbackHub, RealtimeTransport, SessionManager, SyncEvent};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use graph_sync_daemon::commands;
use graph_sync_daemon::config::{Config, Overrides};
use graph_sync_daemon::{FsBlobStore, HttpGateway, RelayServer, RelayTransport};

#[derive(Parser, Debug)]
#[command(name = "graph-sync-daemon")]
#[command(about = "Offline-first room graph sync client")]
struct Args {
    /// Directory for the offline queue and document cache
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Room to join
    #[arg(short, long)]
    room: Option<String>,

    /// Base URL of the persisted store's REST API
    #[arg(short, long)]
    gateway_url: Option<String>,

    /// Base ws:// URL of the realtime relay
    #[arg(long)]
    relay_url: Option<String>,

    /// JSON file with sync tuning (drainMode, queueCapacity, ...)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Peer ID (generated if not provided)
    #[arg(long)]
    peer_id: Option<String>,

    /// Run a relay on this address instead of a client session
    #[arg(long)]
    relay_listen: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the command protocol.
    let default_filter = if args.verbose {
        "debug,graph_sync=debug,graph_sync_daemon=debug"
    } else {
        "info,graph_sync=info,graph_sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(listen) = args.relay_listen {
        let peer_id = args
            .peer_id
            .unwrap_or_else(|| format!("relay-{}", uuid::Uuid::new_v4()));
        return run_relay(&listen, peer_id).await;
    }

    let config = Config::from_env(Overrides {
        data_dir: args.data_dir,
        room: args.room,
        gateway_url: args.gateway_url,
        relay_url: args.relay_url,
        config_file: args.config,
        peer_id: args.peer_id,
    })?;
    run_client(config).await
}

async fn run_relay(listen: &str, peer_id: String) -> Result<()> {
    let server = RelayServer::bind(listen, peer_id).await?;
    info!("Relay running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }
    Ok(())
}

async fn run_client(config: Config) -> Result<()> {
    info!("Starting graph-sync-daemon");
    info!("Data dir: {:?}", config.data_dir);
    info!("Gateway: {}", config.gateway_url);
    info!("Peer ID: {}", config.peer_id);

    let gateway = HttpGateway::new(&config.gateway_url).context("invalid gateway url")?;
    let transport: Arc<dyn RealtimeTransport> = match &config.relay_url {
        Some(url) => {
            info!("Relay: {}", url);
            Arc::new(RelayTransport::new(url.clone(), config.peer_id.clone()))
        }
        None => {
            warn!("No relay configured, running without realtime peers");
            Arc::new(LoopbackHub::new().transport())
        }
    };
    let store = FsBlobStore::new(config.data_dir.clone());

    let manager = SessionManager::new(Arc::new(gateway), transport, Arc::new(store), config.sync.clone());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SyncEvent>();
    let _events = manager.events().subscribe(move |event| {
        let _ = event_tx.send(event.clone());
    });

    manager
        .initialize(config.room.clone())
        .await
        .with_context(|| format!("failed to join room {}", config.room))?;

    info!("Daemon running. Reading commands from stdin, Ctrl+C to stop.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let reply = commands::handle_line(&manager, &line).await;
                        write_line(&mut stdout, &reply).await?;
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }

            Some(event) = event_rx.recv() => {
                let line = json!({ "event": event }).to_string();
                write_line(&mut stdout, &line).await?;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    manager.cleanup().await;
    Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
