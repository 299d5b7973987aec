//! Core error types for hostdeck

use hd_protocol::{ProtocolError, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::EventId;

/// Error category reported to IPC callers as `{kind, message}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidRequest,
    Unauthorized,
    /// Host resources: spawn failures, disk, I/O
    Resource,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Resource => "resource",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Top-level error type for hostdeck
#[derive(Error, Debug)]
pub enum HdError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HdError {
    /// Wire category for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            HdError::Protocol(_) => ErrorKind::InvalidRequest,
            HdError::Process(e) => e.kind(),
            HdError::Session(e) => e.kind(),
            HdError::Job(e) => e.kind(),
            HdError::Event(e) => e.kind(),
            HdError::Config(_) => ErrorKind::Internal,
            HdError::Io(_) => ErrorKind::Resource,
        }
    }
}

/// Process runner errors
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The program could not be started (missing binary, permissions, no PTY)
    #[error("Failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    /// The process has exited or its stdin is closed
    #[error("Process input is closed")]
    InputClosed,

    /// Resize requested on a handle without a controlling terminal
    #[error("Process has no controlling terminal")]
    ResizeUnsupported,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn spawn(program: impl Into<String>, message: impl fmt::Display) -> Self {
        ProcessError::Spawn {
            program: program.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::ResizeUnsupported => ErrorKind::InvalidRequest,
            ProcessError::Spawn { .. } | ProcessError::InputClosed | ProcessError::Io(_) => {
                ErrorKind::Resource
            }
        }
    }
}

/// Session bridge errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },

    #[error("Shell not allowed: {0}")]
    ShellNotAllowed(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::InvalidSize { .. } => ErrorKind::InvalidRequest,
            SessionError::ShellNotAllowed(_) => ErrorKind::Internal,
            SessionError::Process(e) => e.kind(),
        }
    }
}

/// Job orchestrator errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The job's current state forbids the operation
    #[error("{0}")]
    Conflict(String),

    #[error("Invalid job id: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sidecar encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::NotFound(_) => ErrorKind::NotFound,
            JobError::Conflict(_) => ErrorKind::Conflict,
            JobError::InvalidId(_) => ErrorKind::InvalidRequest,
            JobError::Process(_) | JobError::Io(_) => ErrorKind::Resource,
            JobError::Encode(_) => ErrorKind::Internal,
        }
    }
}

/// Event hub errors
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event not found: {0}")]
    NotFound(EventId),
}

impl EventError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EventError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
