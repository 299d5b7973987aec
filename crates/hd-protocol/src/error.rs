//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing or decoding control messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A line exceeded the maximum frame length
    #[error("Line too long: {size} bytes exceeds maximum of {max} bytes")]
    LineTooLong { size: usize, max: usize },

    /// The line was not a valid message
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
