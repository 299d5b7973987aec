//! IPC client for communicating with the daemon
//!
//! Uses TCP on localhost, one JSON object per line.

mod client;

pub use client::{key_to_bytes, DaemonClient, SessionEnd, TerminalSession};

pub use hd_core::ipc::{default_ipc_address, DaemonStatus, SessionInfo, DEFAULT_IPC_PORT};
