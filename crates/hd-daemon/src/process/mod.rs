//! Process runner
//!
//! Spawns OS processes behind the [`Process`](hd_core::traits::Process)
//! trait: a pseudo-terminal backend for interactive shells and a piped
//! backend for one-shot commands.

mod command;
mod pty;
mod runner;

pub use command::PipedProcess;
pub use pty::PtyProcess;
pub use runner::{run_collect, Collected, ProcessRunner};

use hd_core::traits::{OutputChunk, ProcessExit};
use tokio::sync::{mpsc, watch};

/// Capacity of a process's output channel, in chunks
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of a process's input queue, in writes
pub(crate) const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Receive the next chunk, or wait forever once the stream is gone
pub(crate) async fn next_chunk(
    output: &mut Option<mpsc::Receiver<OutputChunk>>,
) -> Option<OutputChunk> {
    match output {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolve once an exit status has been published
pub(crate) async fn wait_exit(exit: &watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    let mut rx = exit.clone();
    let lost = ProcessExit { code: None };
    let exit = match rx.wait_for(Option::is_some).await {
        Ok(status) => (*status).unwrap_or(lost),
        // The waiter went away without publishing
        Err(_) => lost,
    };
    exit
}
