//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::ipc::DEFAULT_IPC_PORT;

/// Configuration for the `hostdeckd` daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// IPC port for CLI communication (localhost only)
    pub ipc_port: u16,

    /// Shared token callers must present before issuing requests
    pub auth_token: Option<String>,

    /// Single-instance PID file
    pub pid_file: PathBuf,

    /// Log level used when RUST_LOG is unset
    pub log_level: String,

    /// Interactive session settings
    pub sessions: SessionSettings,

    /// Background job settings
    pub jobs: JobsConfig,

    /// Event hub settings
    pub events: EventsConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ipc_port: DEFAULT_IPC_PORT,
            auth_token: None,
            pid_file: super::default_config_dir().join("hostdeckd.pid"),
            log_level: "info".to_string(),
            sessions: SessionSettings::default(),
            jobs: JobsConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Get the IPC address (localhost:port)
    pub fn ipc_address(&self) -> String {
        format!("127.0.0.1:{}", self.ipc_port)
    }
}

/// Interactive shell sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Shell to spawn; falls back to $SHELL, then /bin/sh
    pub shell: Option<String>,

    /// Extra environment for spawned shells
    pub env: BTreeMap<String, String>,

    /// Pending input/resize commands per session
    pub input_queue: usize,

    /// Outbound messages buffered per observer
    pub output_queue: usize,

    /// How long output may wait on a full observer queue before the
    /// observer is considered gone
    #[serde(with = "duration_secs")]
    pub send_timeout: Duration,

    /// How long to wait for a killed shell to be reaped
    #[serde(with = "duration_secs")]
    pub kill_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());

        Self {
            shell: None,
            env,
            input_queue: 256,
            output_queue: 256,
            send_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(3),
        }
    }
}

/// Backup and restore jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Directory holding `<jobId>.tar.gz` artifacts and `<jobId>.json` sidecars
    pub backup_dir: PathBuf,

    /// Filesystem root that is archived and restored over
    pub source_root: PathBuf,

    /// Additional tar exclude patterns
    pub extra_excludes: Vec<String>,

    /// Interval between artifact size samples (never below one second)
    #[serde(with = "duration_secs")]
    pub sample_interval: Duration,

    /// Minimum interval between progress sidecar writes
    #[serde(with = "duration_secs")]
    pub persist_interval: Duration,

    /// Expected compressed/uncompressed ratio used for the size estimate
    pub estimate_ratio: f64,

    /// Upper bound on the size estimation command
    #[serde(with = "duration_secs")]
    pub estimate_timeout: Duration,

    /// Delay between accepting a restore and starting extraction
    #[serde(with = "duration_secs")]
    pub restore_grace: Duration,

    /// Command run after a successful restore; empty disables the reboot
    pub reboot_command: Vec<String>,

    /// Archiver binary
    pub tar_program: String,
}

/// Floor for progress sidecar writes
const MIN_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

impl JobsConfig {
    /// Sampling interval with the one-second floor applied
    pub fn effective_sample_interval(&self) -> Duration {
        self.sample_interval.max(Duration::from_secs(1))
    }

    /// Progress persistence interval; never more often than every 5 seconds
    pub fn effective_persist_interval(&self) -> Duration {
        self.persist_interval.max(MIN_PERSIST_INTERVAL)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/var/backups/hostdeck"),
            source_root: PathBuf::from("/"),
            extra_excludes: Vec::new(),
            sample_interval: Duration::from_secs(2),
            persist_interval: Duration::from_secs(5),
            estimate_ratio: 0.5,
            estimate_timeout: Duration::from_secs(120),
            restore_grace: Duration::from_secs(3),
            reboot_command: vec!["reboot".to_string()],
            tar_program: "tar".to_string(),
        }
    }
}

/// Event hub retention and fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Maximum retained events
    pub capacity: usize,

    /// Messages buffered per subscriber before it is dropped
    pub subscriber_queue: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            subscriber_queue: 256,
        }
    }
}
