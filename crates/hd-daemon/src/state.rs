//! Global daemon state

use std::sync::Arc;
use std::time::Instant;

use hd_core::config::DaemonConfig;
use hd_core::ipc::DaemonStatus;
use hd_core::traits::ProcessSpawner;

use crate::events::EventHub;
use crate::jobs::JobOrchestrator;
use crate::process::ProcessRunner;
use crate::session::SessionBridge;

/// Everything the control surface operates on
pub struct DaemonState {
    /// Configuration
    pub config: DaemonConfig,
    /// Interactive shell sessions
    pub sessions: SessionBridge,
    /// Backup and restore jobs
    pub jobs: JobOrchestrator,
    /// Operational events
    pub events: Arc<EventHub>,
    started_at: Instant,
}

impl DaemonState {
    /// Create state backed by real OS processes
    pub fn new(config: DaemonConfig) -> Self {
        let runner: Arc<dyn ProcessSpawner> = Arc::new(ProcessRunner);
        Self::with_spawners(config, Arc::clone(&runner), runner)
    }

    /// Create state with separate spawners for shells and job commands
    pub fn with_spawners(
        config: DaemonConfig,
        session_spawner: Arc<dyn ProcessSpawner>,
        job_spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let events = Arc::new(EventHub::new(&config.events));
        Self {
            sessions: SessionBridge::new(config.sessions.clone(), session_spawner),
            jobs: JobOrchestrator::new(config.jobs.clone(), job_spawner, Arc::clone(&events)),
            events,
            config,
            started_at: Instant::now(),
        }
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            running: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            session_count: self.sessions.len(),
            job_count: self.jobs.len(),
            running_jobs: self.jobs.running_count(),
            event_count: self.events.len(),
            unread_events: self.events.unread_count(),
            backup_dir: self.config.jobs.backup_dir.display().to_string(),
        }
    }
}
