//! collab-server: Realtime collaboration server for notes and templates.
//!
//! Runs two listeners side by side:
//! - the WebSocket multiplexer, one room per document
//! - the HTTP snapshot gateway

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use collab_server::config::Config;
use collab_server::native_store::FileStore;
use collab_server::{AppState, Multiplexer, gateway};

#[derive(Parser, Debug)]
#[command(name = "collab-server")]
#[command(about = "Collaborative editing server for notes and templates")]
struct Args {
    /// Path to config directory
    #[arg(long, default_value = "/config", env = "COLLAB_CONFIG_PATH")]
    config_path: PathBuf,

    /// Address for WebSocket connections (overrides config)
    #[arg(long, env = "COLLAB_WS_LISTEN")]
    ws_listen: Option<String>,

    /// Address for the HTTP snapshot gateway (overrides config)
    #[arg(long, env = "COLLAB_HTTP_LISTEN")]
    http_listen: Option<String>,

    /// Directory holding entity records and snapshots (overrides config)
    #[arg(long, env = "COLLAB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Seconds before an unused room is flushed and evicted, 0 to disable (overrides config)
    #[arg(long, env = "COLLAB_ROOM_IDLE_GRACE")]
    idle_grace_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn apply(self, mut config: Config) -> Config {
        if let Some(addr) = self.ws_listen {
            config.ws_listen = addr;
        }
        if let Some(addr) = self.http_listen {
            config.http_listen = addr;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(secs) = self.idle_grace_secs {
            config.rooms.idle_grace_secs = secs;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,collab_server=debug"
    } else {
        "info,collab_server=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting collab-server");

    let config = Config::load(&args.config_path)?;
    let config = args.apply(config);
    info!("Data directory: {:?}", config.data_dir);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory: {:?}", config.data_dir))?;
    let store = Arc::new(FileStore::new(config.data_dir.clone()));

    let app = Arc::new(AppState::new(
        store,
        config.rooms.idle_grace(),
        config.connections.clone(),
    ));

    let ws_listener = Multiplexer::bind(&config.ws_listen).await?;
    let multiplexer = Arc::new(Multiplexer::new(Arc::clone(&app)));
    let ws_task = tokio::spawn(multiplexer.serve(ws_listener));

    let http_listener = tokio::net::TcpListener::bind(&config.http_listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_listen))?;
    info!("Snapshot gateway listening on {}", config.http_listen);

    axum::serve(http_listener, gateway::router(Arc::clone(&app)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ws_task.abort();
    let flushed = app.registry.flush_all().await;
    info!("Flushed {} room(s), shutting down", flushed);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
