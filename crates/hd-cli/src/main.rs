//! hostdeck CLI
//!
//! Operator front-end for hostdeckd:
//! - Interactive shells on the daemon host
//! - Backups, restores and their notes
//! - The event feed

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hd_core::config::{self, DaemonConfig};
use hd_core::types::ReadTarget;
use hostdeck::commands;
use hostdeck::ipc::DaemonClient;
use hostdeck::output::{print_error, print_info, print_success, print_warning};

#[derive(Parser)]
#[command(name = "hostdeck")]
#[command(author, version, about = "Remote shells, backups and events for a single host")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the daemon configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// IPC port of the daemon (overrides config)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Shared token for authenticating with the daemon
    #[arg(long, global = true, env = "HOSTDECK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,

    /// Open an interactive shell on the host
    Shell,

    /// List or close open sessions
    Sessions {
        #[command(subcommand)]
        action: Option<SessionsAction>,
    },

    /// Create, inspect and restore backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Read and manage operator events
    Events {
        #[command(subcommand)]
        action: Option<EventsAction>,
    },

    /// Stop the daemon
    Stop,
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List open sessions
    List,
    /// Close sessions
    Close {
        /// Numeric session id(s)
        #[arg(required = true)]
        ids: Vec<u32>,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Start a new backup
    Create {
        /// Free-form notes stored with the backup
        #[arg(short, long)]
        notes: Option<String>,
        /// Follow progress until the backup finishes
        #[arg(short, long)]
        wait: bool,
    },
    /// List jobs, newest first
    List,
    /// Show one job
    Show { job_id: String },
    /// Replace a job's notes
    Notes { job_id: String, notes: String },
    /// Delete finished jobs and their archives
    Delete {
        #[arg(required = true)]
        job_ids: Vec<String>,
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
    /// Restore the host from a completed backup, then reboot
    Restore {
        job_id: String,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum EventsAction {
    /// List events, newest first
    List {
        /// Only unread events
        #[arg(short, long)]
        unread: bool,
    },
    /// Print events as they arrive
    Watch,
    /// Mark events read: an event id or "all"
    Read {
        #[arg(default_value = "all")]
        target: ReadTarget,
    },
    /// Delete events
    Delete {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
    /// Delete all events
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let client = build_client(&cli)?;

    let command = match cli.command {
        Some(cmd) => cmd,
        None => {
            show_quick_status(client).await;
            return Ok(());
        }
    };

    let mut client = client;
    match command {
        Commands::Status => commands::status_command(&mut client).await?,

        // The connection is handed over to the session
        Commands::Shell => {
            if let Some(code) = commands::shell_command(client).await? {
                std::process::exit(code);
            }
        }

        Commands::Sessions { action } => match action.unwrap_or(SessionsAction::List) {
            SessionsAction::List => commands::sessions_list(&mut client).await?,
            SessionsAction::Close { ids } => commands::sessions_close(&mut client, &ids).await?,
        },

        Commands::Backup { action } => match action {
            BackupAction::Create { notes, wait } => {
                commands::backup_create(&mut client, notes, wait).await?
            }
            BackupAction::List => commands::backup_list(&mut client).await?,
            BackupAction::Show { job_id } => commands::backup_show(&mut client, &job_id).await?,
            BackupAction::Notes { job_id, notes } => {
                commands::backup_notes(&mut client, &job_id, &notes).await?
            }
            BackupAction::Delete { job_ids, force } => {
                commands::backup_delete(&mut client, &job_ids, force).await?
            }
            BackupAction::Restore { job_id, yes } => {
                commands::backup_restore(&mut client, &job_id, yes).await?
            }
        },

        Commands::Events { action } => {
            match action.unwrap_or(EventsAction::List { unread: false }) {
                EventsAction::List { unread } => commands::events_list(&mut client, unread).await?,
                EventsAction::Watch => commands::events_watch(&mut client).await?,
                EventsAction::Read { target } => commands::events_read(&mut client, target).await?,
                EventsAction::Delete { ids } => commands::events_delete(&mut client, &ids).await?,
                EventsAction::Clear => commands::events_clear(&mut client).await?,
            }
        }

        Commands::Stop => {
            print_info("Stopping daemon...");
            match client.shutdown().await {
                Ok(()) => print_success("Daemon stopped"),
                Err(e) => {
                    if e.to_string().contains("Is it running") {
                        print_warning("Daemon is not running");
                    } else {
                        print_error(&format!("Failed to stop daemon: {}", e));
                        return Err(e);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Address and token come from flags first, then the daemon's config file
fn build_client(cli: &Cli) -> Result<DaemonClient> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let mut daemon_config: DaemonConfig = config::load_config_or_default(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if let Some(port) = cli.port {
        daemon_config.ipc_port = port;
    }
    let token = cli.token.clone().or(daemon_config.auth_token.clone());

    Ok(DaemonClient::with_address(daemon_config.ipc_address(), token))
}

/// Short summary shown when no command is given
async fn show_quick_status(mut client: DaemonClient) {
    let address = client.address().to_string();
    match client.ping().await {
        Ok(true) => {
            print_success(&format!("hostdeckd is running at {}", address));
            if let Ok(status) = client.status().await {
                println!(
                    "  {} session(s), {} job(s) running, {} unread event(s)",
                    status.session_count, status.running_jobs, status.unread_events
                );
            }
        }
        _ => {
            print_warning(&format!("hostdeckd is not reachable at {}", address));
            println!("  Start it with: hostdeckd --foreground");
        }
    }
    println!("\nRun 'hostdeck --help' for commands");
}
