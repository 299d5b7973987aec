//! Session channel messages
//!
//! Once a control connection opens a session it becomes a dedicated
//! session channel. From then on each line carries one `SessionMessage`:
//!
//! - client to daemon: `input`, `resize`
//! - daemon to client: `output`, and exactly one final `ended`
//!
//! After `ended` the daemon closes the connection.

use serde::{Deserialize, Serialize};

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Default terminal size (24x80)
    pub fn default_size() -> Self {
        Self { rows: 24, cols: 80 }
    }

    /// A terminal with zero rows or columns cannot be allocated
    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

/// One message on a session channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMessage {
    /// Raw bytes for the shell's input
    Input { data: Vec<u8> },

    /// Resize the controlling terminal
    Resize { rows: u16, cols: u16 },

    /// Raw bytes produced by the shell
    Output { data: Vec<u8> },

    /// The session is over; the channel closes after this message
    Ended {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        reason: String,
    },
}

impl SessionMessage {
    /// Whether this message travels from the client to the daemon
    pub fn is_inbound(&self) -> bool {
        matches!(self, SessionMessage::Input { .. } | SessionMessage::Resize { .. })
    }
}
