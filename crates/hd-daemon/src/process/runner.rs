//! Default spawner and one-shot helpers

use std::time::Duration;

use hd_core::error::ProcessError;
use hd_core::traits::{OutputStream, Process, ProcessExit, ProcessSpawner, ProcessSpec};

use super::{PipedProcess, PtyProcess};

/// Spawns real OS processes: on a PTY when the spec asks for a terminal,
/// on pipes otherwise
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessSpawner for ProcessRunner {
    fn spawn(&self, spec: ProcessSpec) -> Result<Box<dyn Process>, ProcessError> {
        match spec.pty {
            Some(size) => Ok(Box::new(PtyProcess::spawn(&spec, size)?)),
            None => Ok(Box::new(PipedProcess::spawn(&spec)?)),
        }
    }
}

/// Result of [`run_collect`]
#[derive(Debug, Clone)]
pub struct Collected {
    pub exit: ProcessExit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Collected {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run a command to completion, collecting its output
///
/// The child is killed if it outlives `limit`.
pub async fn run_collect(
    spawner: &dyn ProcessSpawner,
    spec: ProcessSpec,
    limit: Duration,
) -> Result<Collected, ProcessError> {
    let program = spec.program.clone();
    let mut process = spawner.spawn(spec)?;
    let mut output = process.take_output();

    let collect = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(rx) = output.as_mut() {
            while let Some(chunk) = rx.recv().await {
                match chunk.stream {
                    OutputStream::Stdout => stdout.extend_from_slice(&chunk.data),
                    OutputStream::Stderr => stderr.extend_from_slice(&chunk.data),
                }
            }
        }
        let exit = process.wait().await;
        Collected {
            exit,
            stdout,
            stderr,
        }
    };

    match tokio::time::timeout(limit, collect).await {
        Ok(collected) => Ok(collected),
        Err(_) => {
            process.kill();
            Err(ProcessError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} did not finish within {:?}", program, limit),
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use hd_protocol::TerminalSize;

    #[tokio::test]
    async fn test_run_collect_separates_streams() {
        let spec = ProcessSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo hello; echo oops >&2");
        let collected = run_collect(&ProcessRunner, spec, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(collected.exit.success());
        assert_eq!(collected.stdout_lossy(), "hello\n");
        assert_eq!(collected.stderr_lossy(), "oops\n");
    }

    #[tokio::test]
    async fn test_run_collect_times_out() {
        let spec = ProcessSpec::new("sleep").arg("30");
        let err = run_collect(&ProcessRunner, spec, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn test_runner_picks_backend_from_spec() {
        let runner = ProcessRunner;

        let piped = runner.spawn(ProcessSpec::new("true")).unwrap();
        assert!(piped.resize(TerminalSize::default()).is_err());
        piped.wait().await;

        let pty = runner
            .spawn(ProcessSpec::new("/bin/sh").with_pty(TerminalSize::default()))
            .unwrap();
        assert!(pty.resize(TerminalSize::new(30, 100)).is_ok());
        pty.kill();
    }
}
