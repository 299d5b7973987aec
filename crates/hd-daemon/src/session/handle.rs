//! Per-session handle shared between the registry and the relay

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hd_core::ipc::SessionInfo;
use hd_core::traits::SessionState;
use hd_protocol::{SessionId, TerminalSize};

/// Work for a session's relay task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCommand {
    Input(Bytes),
    Resize(TerminalSize),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a live session
///
/// The process itself is owned by the relay task; the handle only carries
/// what other components need to observe or steer it.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub shell: String,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    state: AtomicU8,
    size: Mutex<TerminalSize>,
    close_reason: Mutex<Option<String>>,
    commands: mpsc::Sender<RelayCommand>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        shell: String,
        pid: Option<u32>,
        size: TerminalSize,
        commands: mpsc::Sender<RelayCommand>,
    ) -> Self {
        Self {
            id,
            shell,
            pid,
            created_at: hd_core::time::now(),
            state: AtomicU8::new(SessionState::Connecting.as_u8()),
            size: Mutex::new(size),
            close_reason: Mutex::new(None),
            commands,
            cancel: CancellationToken::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    pub(crate) fn set_size(&self, size: TerminalSize) {
        *lock(&self.size) = size;
    }

    /// Connecting -> Active
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting.as_u8(),
                SessionState::Active.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Enter Closing; true only for the caller that made the transition
    pub(crate) fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if SessionState::from_u8(current).is_closing() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Enter Closed; true exactly once
    pub(crate) fn mark_closed(&self) -> bool {
        self.state.swap(SessionState::Closed.as_u8(), Ordering::AcqRel)
            != SessionState::Closed.as_u8()
    }

    /// Ask the relay to tear the session down. The first reason wins.
    pub fn request_close(&self, reason: &str) {
        self.note_close_reason(reason);
        self.cancel.cancel();
    }

    /// Record why the session ended unless a reason is already set
    pub(crate) fn note_close_reason(&self, reason: &str) {
        let mut current = lock(&self.close_reason);
        if current.is_none() {
            *current = Some(reason.to_string());
        }
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.close_reason).clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn commands(&self) -> &mpsc::Sender<RelayCommand> {
        &self.commands
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            pid: self.pid,
            shell: self.shell.clone(),
            state: self.state().to_string(),
            size: self.size(),
            created_at: self.created_at,
        }
    }
}
