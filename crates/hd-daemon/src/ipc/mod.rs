//! IPC server for CLI communication
//!
//! Localhost TCP server speaking newline-delimited JSON. A connection
//! carries requests and responses, event pushes after `subscribe_events`,
//! and becomes a session channel after `open_session`.

mod server;

pub use server::IpcServer;
