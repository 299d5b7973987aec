//! hostdeck: Command-line interface for the hostdeck daemon
//!
//! Provides the `hostdeck` CLI for opening shells, managing backups and
//! following operator events.

pub mod commands;
pub mod ipc;
pub mod output;
