//! Session bridge
//!
//! Attaches each observer channel to its own interactive shell. Every
//! session gets one relay task that owns the shell process; the rest of
//! the daemon talks to it through the session's command queue.

mod bridge;
mod handle;
mod relay;
mod shell;

pub use bridge::SessionBridge;
pub use handle::{RelayCommand, SessionHandle};
pub use shell::{resolve_shell, validate_shell_path};
