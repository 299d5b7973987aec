//! hd-daemon: Control plane for a single host
//!
//! The daemon multiplexes interactive shell sessions over localhost
//! connections, runs full-system backup and restore jobs in the background
//! with persisted progress, and fans operational events out to every
//! subscribed client.

pub mod events;
pub mod ipc;
pub mod jobs;
pub mod process;
pub mod session;
pub mod state;

pub use state::DaemonState;
