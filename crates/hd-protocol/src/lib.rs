//! hd-protocol: Wire protocol for the hostdeck control surface
//!
//! Every message on a control connection is one JSON object per line.
//! This crate defines the line codec, the session channel messages and
//! the identifiers shared by the daemon and its clients.

pub mod codec;
pub mod error;
pub mod message;
pub mod session;

pub use codec::{decode_message, JsonLineCodec, MAX_LINE_LENGTH};
pub use error::ProtocolError;
pub use message::{SessionMessage, TerminalSize};
pub use session::SessionId;
