//! Session registry and operations

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use hd_core::config::SessionSettings;
use hd_core::error::SessionError;
use hd_core::traits::{ProcessSpawner, ProcessSpec, SessionState};
use hd_protocol::{SessionId, SessionMessage, TerminalSize};

use super::handle::{RelayCommand, SessionHandle};
use super::relay::Relay;
use super::shell::resolve_shell;

/// Registry of interactive sessions
pub struct SessionBridge {
    sessions: Arc<DashMap<SessionId, Arc<SessionHandle>>>,
    next_id: AtomicU32,
    spawner: Arc<dyn ProcessSpawner>,
    settings: SessionSettings,
}

impl SessionBridge {
    pub fn new(settings: SessionSettings, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU32::new(1),
            spawner,
            settings,
        }
    }

    /// Spawn a shell for `observer` and start relaying
    ///
    /// The observer receives `output` messages followed by exactly one
    /// `ended`. Dropping its receiver closes the session.
    pub async fn open_session(
        &self,
        observer: mpsc::Sender<SessionMessage>,
        size: Option<TerminalSize>,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        let size = size.unwrap_or_default();
        if !size.is_valid() {
            return Err(SessionError::InvalidSize {
                rows: size.rows,
                cols: size.cols,
            });
        }

        let shell = resolve_shell(self.settings.shell.as_deref())?;
        let mut spec = ProcessSpec::new(shell.clone()).with_pty(size);
        for (key, value) in &self.settings.env {
            spec = spec.env(key, value);
        }
        if let Some(home) = std::env::var_os("HOME") {
            spec = spec.current_dir(home);
        }

        let process = self.spawner.spawn(spec)?;

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (command_tx, command_rx) = mpsc::channel(self.settings.input_queue.max(1));
        let handle = Arc::new(SessionHandle::new(
            id,
            shell,
            process.pid(),
            size,
            command_tx,
        ));
        self.sessions.insert(id, Arc::clone(&handle));

        let relay = Relay {
            handle: Arc::clone(&handle),
            process,
            observer,
            commands: command_rx,
            registry: Arc::clone(&self.sessions),
            send_timeout: self.settings.send_timeout,
            kill_timeout: self.settings.kill_timeout,
        };
        handle.activate();
        tokio::spawn(relay.run());

        tracing::info!(
            "Opened session {} ({}, pid {:?}, {}x{})",
            id,
            handle.shell,
            handle.pid(),
            size.cols,
            size.rows
        );

        Ok(handle)
    }

    /// Forward raw bytes to the session's shell
    ///
    /// Input for a session that is not Active is dropped.
    pub async fn handle_input(&self, id: SessionId, data: Bytes) -> Result<(), SessionError> {
        let handle = self.get(id).ok_or(SessionError::NotFound(id))?;

        if handle.state() != SessionState::Active {
            tracing::debug!("Dropping {} bytes for {} ({})", data.len(), id, handle.state());
            return Ok(());
        }

        if handle
            .commands()
            .send(RelayCommand::Input(data))
            .await
            .is_err()
        {
            tracing::debug!("Relay for {} is gone", id);
        }
        Ok(())
    }

    /// Resize the session's terminal; a no-op for unknown or closing sessions
    pub fn handle_resize(&self, id: SessionId, rows: u16, cols: u16) -> Result<(), SessionError> {
        let size = TerminalSize::new(rows, cols);
        if !size.is_valid() {
            return Err(SessionError::InvalidSize { rows, cols });
        }

        let Some(handle) = self.get(id) else {
            return Ok(());
        };
        if handle.state().is_closing() {
            return Ok(());
        }

        handle.set_size(size);
        if let Err(e) = handle.commands().try_send(RelayCommand::Resize(size)) {
            tracing::debug!("Resize for {} not queued: {}", id, e);
        }
        Ok(())
    }

    /// Terminate the session's shell and observer channel
    ///
    /// Idempotent; returns false if no such session is registered.
    pub fn close_session(&self, id: SessionId, reason: &str) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.request_close(reason);
                true
            }
            None => false,
        }
    }

    /// Close every session and wait up to `timeout` for them to finish
    pub async fn close_all(&self, reason: &str, timeout: Duration) {
        let handles = self.list();
        if handles.is_empty() {
            return;
        }

        tracing::info!("Closing {} sessions: {}", handles.len(), reason);
        for handle in &handles {
            handle.request_close(reason);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if !self.sessions.is_empty() {
            tracing::warn!("{} sessions still closing at shutdown", self.sessions.len());
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|r| Arc::clone(&r))
    }

    /// All registered sessions, ordered by id
    pub fn list(&self) -> Vec<Arc<SessionHandle>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(&r)).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
