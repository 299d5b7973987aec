//! hostdeck daemon
//!
//! Serves the localhost control surface: interactive shells, backup and
//! restore jobs, and the operator event feed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hd_core::config::{self, DaemonConfig};
use hd_core::instance::InstanceLock;
use hd_daemon::ipc::IpcServer;
use hd_daemon::DaemonState;

/// How long sessions get to wind down at shutdown
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "hostdeckd")]
#[command(about = "hostdeck control-plane daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IPC port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace); defaults to the config value
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut config: DaemonConfig = config::load_config_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    if let Some(port) = args.port {
        config.ipc_port = port;
    }

    // Initialize logging
    let log_level = if args.foreground {
        "debug".to_string()
    } else {
        args.log_level.clone().unwrap_or_else(|| config.log_level.clone())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(log_level),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("hostdeckd {} starting...", env!("CARGO_PKG_VERSION"));
    if config.auth_token.is_none() {
        tracing::warn!("No auth_token configured - any local user can control the daemon");
    }

    let _lock = InstanceLock::acquire(&config.pid_file)
        .with_context(|| format!("Failed to take PID file {:?}", config.pid_file))?;

    let state = Arc::new(DaemonState::new(config.clone()));

    let report = state
        .jobs
        .reconcile()
        .await
        .with_context(|| format!("Failed to load jobs from {:?}", config.jobs.backup_dir))?;
    tracing::debug!("Job reconciliation: {:?}", report);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let server = IpcServer::new(config.ipc_address(), Arc::clone(&state), cancel.clone());
    let served = server.run().await;
    cancel.cancel();

    // Running jobs are left as they are; their records are reconciled on
    // the next start
    state
        .sessions
        .close_all("daemon shutting down", SESSION_SHUTDOWN_TIMEOUT)
        .await;

    served?;
    tracing::info!("hostdeckd shutdown complete");
    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
async fn watch_signals(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
        _ = cancel.cancelled() => return,
    }

    cancel.cancel();
}
