//! hd-core: Core abstractions and configuration for hostdeck
//!
//! This crate provides shared types, traits, and configuration structures
//! used by the daemon and the CLI.

pub mod config;
pub mod error;
pub mod instance;
pub mod ipc;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ErrorKind, HdError};
pub use types::{Event, EventId, EventKind, JobId, JobKind, JobRecord, JobStatus};
