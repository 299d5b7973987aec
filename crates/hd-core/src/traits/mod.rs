//! Core trait definitions

mod process;
mod session;

pub use process::{OutputChunk, OutputStream, Process, ProcessExit, ProcessSpawner, ProcessSpec};
pub use session::SessionState;
