//! Process runner abstraction
//!
//! A [`Process`] is a live child with an ordered input side, a stream of
//! output chunks and an exit status. Interactive shells get a controlling
//! terminal; one-shot commands get plain pipes. Both sit behind the same
//! trait so the session bridge and the job orchestrator can be driven by
//! test doubles through [`ProcessSpawner`].

use async_trait::async_trait;
use bytes::Bytes;
use hd_protocol::TerminalSize;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::error::ProcessError;

/// What to run
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Allocate a controlling terminal of this size
    pub pty: Option<TerminalSize>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_pty(mut self, size: TerminalSize) -> Self {
        self.pty = Some(size);
        self
    }
}

/// Which stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Bytes read from a child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Bytes,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            data: data.into(),
        }
    }
}

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when killed by a signal or the status was lost
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A live child process
#[async_trait]
pub trait Process: Send + Sync {
    /// OS process id, when known
    fn pid(&self) -> Option<u32>;

    /// Queue bytes for the child's input. Order across calls is preserved.
    ///
    /// Fails with [`ProcessError::InputClosed`] once the child is gone.
    async fn write(&self, data: Bytes) -> Result<(), ProcessError>;

    /// Take the output stream; `None` after the first call.
    ///
    /// The stream ends when the child closes its output.
    fn take_output(&mut self) -> Option<mpsc::Receiver<OutputChunk>>;

    /// Resize the controlling terminal
    fn resize(&self, size: TerminalSize) -> Result<(), ProcessError>;

    /// Resolve once the child has exited
    async fn wait(&self) -> ProcessExit;

    /// Exit status if the child has already exited
    fn try_exit(&self) -> Option<ProcessExit>;

    /// Terminate the child. Safe to call repeatedly and after exit.
    fn kill(&self);
}

/// Starts processes
pub trait ProcessSpawner: Send + Sync {
    /// Spawn `spec`, returning as soon as the child is running
    fn spawn(&self, spec: ProcessSpec) -> Result<Box<dyn Process>, ProcessError>;
}
