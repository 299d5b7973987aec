//! Session lifecycle state

use std::fmt;

/// Session lifecycle: `Connecting -> Active -> Closing -> Closed`
///
/// Closing is entered from either side's disconnect and never left except
/// into Closed, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Shell spawned, relay not yet running
    Connecting = 0,
    /// Relaying I/O
    Active = 1,
    /// Teardown in progress
    Closing = 2,
    /// Process reaped and observer notified
    Closed = 3,
}

impl SessionState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Whether teardown has started
    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}
