//! Pipe-backed processes for one-shot commands

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use hd_core::error::ProcessError;
use hd_core::traits::{OutputChunk, OutputStream, Process, ProcessExit, ProcessSpec};
use hd_protocol::TerminalSize;

use super::{wait_exit, INPUT_CHANNEL_CAPACITY, OUTPUT_CHANNEL_CAPACITY};

/// A child with piped stdin/stdout/stderr
///
/// Must be spawned from within a Tokio runtime.
pub struct PipedProcess {
    pid: Option<u32>,
    input: mpsc::Sender<Bytes>,
    output: Option<mpsc::Receiver<OutputChunk>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: CancellationToken,
}

impl PipedProcess {
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::spawn(&spec.program, e))?;
        let pid = child.id();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputStream::Stdout, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputStream::Stderr, output_tx));
        }

        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(feed(stdin, input_rx));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        tokio::spawn(reap(child, kill.clone(), exit_tx));

        tracing::debug!("Spawned {} (pid {:?})", spec.program, pid);

        Ok(Self {
            pid,
            input: input_tx,
            output: Some(output_rx),
            exit: exit_rx,
            kill,
        })
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("{:?} pump stopped: {}", stream, e);
                break;
            }
        }
    }
}

async fn feed(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            tracing::debug!("stdin closed: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!("stdin flush failed: {}", e);
            break;
        }
    }
    // Dropping stdin delivers EOF to the child
}

async fn reap(mut child: Child, kill: CancellationToken, exit_tx: watch::Sender<Option<ProcessExit>>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::trace!("start_kill: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!("Failed to reap child: {}", e);
            None
        }
    };
    exit_tx.send_replace(Some(ProcessExit { code }));
}

#[async_trait]
impl Process for PipedProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&self, data: Bytes) -> Result<(), ProcessError> {
        if self.try_exit().is_some() {
            return Err(ProcessError::InputClosed);
        }
        self.input
            .send(data)
            .await
            .map_err(|_| ProcessError::InputClosed)
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<OutputChunk>> {
        self.output.take()
    }

    fn resize(&self, _size: TerminalSize) -> Result<(), ProcessError> {
        Err(ProcessError::ResizeUnsupported)
    }

    async fn wait(&self) -> ProcessExit {
        wait_exit(&self.exit).await
    }

    fn try_exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    fn kill(&self) {
        self.kill.cancel();
    }
}

impl Drop for PipedProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}
