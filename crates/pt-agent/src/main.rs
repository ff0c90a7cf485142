//! pocket-terminal Agent Daemon
//!
//! The agent runs on the desktop host and serves terminal sessions to
//! remote clients over one framed connection per client. Sessions run in a
//! native PTY or inside tmux/screen, and survive client disconnects for a
//! configurable reconnection window.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pt_agent::backend::BackendSet;
use pt_agent::server::Listener;
use pt_agent::session::{run_expiry_sweep, RegistrySnapshot, SessionService};
use pt_agent::AgentState;
use pt_core::config::{self, AgentConfig};
use pt_protocol::MultiplexerType;

#[derive(Parser)]
#[command(name = "pt-agent")]
#[command(about = "pocket-terminal agent - serves terminal sessions to remote clients")]
#[command(version)]
struct Args {
    /// Address to listen on, e.g. 0.0.0.0:7681
    #[arg(short, long)]
    bind: Option<std::net::SocketAddr>,

    /// Default multiplexer for new sessions (native, tmux, screen)
    #[arg(short, long)]
    multiplexer: Option<MultiplexerType>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("pocket-terminal agent starting...");

    // Load configuration
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);

    let mut config = if config_path.exists() {
        config::load_config(&config_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
            AgentConfig::default()
        })
    } else {
        AgentConfig::default()
    };

    // Apply command-line overrides
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(multiplexer) = args.multiplexer {
        config.preferred_multiplexer = multiplexer;
    }
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        "Host {} - up to {} connections, {} sessions",
        gethostname::gethostname().to_string_lossy(),
        config.max_connections,
        config.max_total_sessions
    );

    let backends = BackendSet::new();
    backends.initialize_all().await;

    let state_file = config.state_file.clone();
    let (service, exits) = SessionService::new(config, backends);
    let service = Arc::new(service);

    if let Some(path) = &state_file {
        match load_snapshot(path).await {
            Ok(Some(snapshot)) => {
                let restored = service.restore(snapshot);
                tracing::info!("Restored {} sessions from {:?}", restored, path);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring saved sessions: {:#}", e),
        }
    }

    let cancel = CancellationToken::new();
    let state = Arc::new(AgentState::new(Arc::clone(&service), cancel.clone()));

    let listener = Listener::new(Arc::clone(&state));
    let socket = listener.bind().await?;
    let server = tokio::spawn(listener.run(socket));

    let sweeper = tokio::spawn(run_expiry_sweep(
        Arc::clone(&service),
        state.config.cleanup_interval,
        cancel.clone(),
    ));
    let watcher = tokio::spawn(Arc::clone(&service).run_exit_watcher(exits, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");
    cancel.cancel();

    // Connections first, so their sessions are settled before the snapshot
    if let Err(e) = server.await {
        tracing::error!("Listener task failed: {}", e);
    }
    let _ = tokio::join!(sweeper, watcher);

    let snapshot = service.shutdown().await;
    if let Some(path) = &state_file {
        save_snapshot(path, &snapshot)
            .await
            .with_context(|| format!("Failed to save sessions to {:?}", path))?;
        tracing::info!("Saved {} sessions to {:?}", snapshot.sessions.len(), path);
    }

    tracing::info!("pocket-terminal agent stopped");
    Ok(())
}

async fn load_snapshot(path: &Path) -> Result<Option<RegistrySnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let snapshot = serde_json::from_str(&text).with_context(|| format!("Failed to parse {:?}", path))?;
    Ok(Some(snapshot))
}

async fn save_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    let text = serde_json::to_string_pretty(snapshot)?;
    tokio::fs::write(path, text).await?;
    Ok(())
}
