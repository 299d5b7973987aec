//! Pseudo-terminal backed processes

use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};
use std::thread;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};

use hd_core::error::ProcessError;
use hd_core::traits::{OutputChunk, Process, ProcessExit, ProcessSpec};
use hd_protocol::TerminalSize;

use super::{wait_exit, INPUT_CHANNEL_CAPACITY, OUTPUT_CHANNEL_CAPACITY};

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A child attached to the slave side of a PTY
///
/// The master is read and written by dedicated threads because
/// `portable-pty` only offers blocking handles. The terminal merges the
/// child's stdout and stderr, so every chunk is tagged stdout.
pub struct PtyProcess {
    pid: Option<u32>,
    input: mpsc::Sender<Bytes>,
    output: Option<mpsc::Receiver<OutputChunk>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyProcess {
    /// Open a PTY of `size` and spawn `spec` on it
    pub fn spawn(spec: &ProcessSpec, size: TerminalSize) -> Result<Self, ProcessError> {
        let program = spec.program.as_str();

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| ProcessError::spawn(program, format!("failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            cmd.cwd(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ProcessError::spawn(program, e))?;

        // The child holds its own slave handle; ours would keep the master
        // from seeing EOF after the child exits.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::spawn(program, format!("failed to clone PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::spawn(program, format!("failed to take PTY writer: {}", e)))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        spawn_thread("pty-reader", move || read_loop(reader, output_tx))?;
        spawn_thread("pty-writer", move || write_loop(writer, input_rx))?;
        spawn_thread("pty-waiter", move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    tracing::warn!("Failed to wait for PTY child: {}", e);
                    None
                }
            };
            exit_tx.send_replace(Some(ProcessExit { code }));
        })?;

        tracing::debug!("Spawned {} on PTY (pid {:?}, {}x{})", program, pid, size.cols, size.rows);

        Ok(Self {
            pid,
            input: input_tx,
            output: Some(output_rx),
            exit: exit_rx,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
        })
    }
}

fn spawn_thread<F>(name: &str, f: F) -> Result<(), ProcessError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(ProcessError::Io)
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<OutputChunk>) {
    let mut buf = [0u8; 4096];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx
                    .blocking_send(OutputChunk::stdout(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is closed
            Err(e) => {
                tracing::trace!("PTY reader stopped: {}", e);
                break;
            }
        }
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            tracing::debug!("PTY writer stopped: {}", e);
            break;
        }
    }
}

#[async_trait]
impl Process for PtyProcess {
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

    fn resize(&self, size: TerminalSize) -> Result<(), ProcessError> {
        lock(&self.master)
            .resize(pty_size(size))
            .map_err(|e| ProcessError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }

    async fn wait(&self) -> ProcessExit {
        wait_exit(&self.exit).await
    }

    fn try_exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    fn kill(&self) {
        if self.try_exit().is_some() {
            return;
        }
        if let Err(e) = lock(&self.killer).kill() {
            tracing::trace!("PTY kill: {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn read_until(rx: &mut mpsc::Receiver<OutputChunk>, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !seen.contains(needle) {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(chunk)) => seen.push_str(&String::from_utf8_lossy(&chunk.data)),
                _ => break,
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_pty_echo_and_exit_code() {
        let spec = ProcessSpec::new("/bin/sh");
        let mut process = PtyProcess::spawn(&spec, TerminalSize::default()).unwrap();
        let mut output = process.take_output().unwrap();
        assert!(process.take_output().is_none());

        process
            .write(Bytes::from_static(b"echo pty-$((40+2)); exit 3\n"))
            .await
            .unwrap();

        let seen = read_until(&mut output, "pty-42").await;
        assert!(seen.contains("pty-42"), "output was {:?}", seen);

        let exit = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap();
        assert_eq!(exit.code, Some(3));

        // Writes after exit fail instead of panicking
        assert!(matches!(
            process.write(Bytes::from_static(b"x")).await,
            Err(ProcessError::InputClosed)
        ));
        process.kill();
    }

    #[tokio::test]
    async fn test_pty_resize_is_visible_to_child() {
        let spec = ProcessSpec::new("/bin/sh");
        let mut process = PtyProcess::spawn(&spec, TerminalSize::new(24, 80)).unwrap();
        let mut output = process.take_output().unwrap();

        process.resize(TerminalSize::new(40, 120)).unwrap();
        process
            .write(Bytes::from_static(b"stty size; exit\n"))
            .await
            .unwrap();

        let seen = read_until(&mut output, "40 120").await;
        assert!(seen.contains("40 120"), "output was {:?}", seen);
        process.kill();
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let spec = ProcessSpec::new("/bin/sh");
        let process = PtyProcess::spawn(&spec, TerminalSize::default()).unwrap();

        process.kill();
        process.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap();
        assert!(!exit.success());
        process.kill();
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let spec = ProcessSpec::new("/nonexistent/definitely-not-a-shell");
        let result = PtyProcess::spawn(&spec, TerminalSize::default());
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}
