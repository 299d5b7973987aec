//! Per-session relay task

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Instant;

use hd_core::traits::{OutputChunk, Process, ProcessExit};
use hd_protocol::{SessionId, SessionMessage};

use super::handle::{RelayCommand, SessionHandle};
use crate::process::next_chunk;

/// How long to keep forwarding buffered output after the shell exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Why a session ended
#[derive(Debug)]
enum Outcome {
    Exited(ProcessExit),
    Requested(String),
    ObserverGone,
    SlowObserver,
}

impl Outcome {
    fn reason(&self) -> String {
        match self {
            Outcome::Exited(_) => "process exited".to_string(),
            Outcome::Requested(reason) => format!("closed: {}", reason),
            Outcome::ObserverGone => "observer disconnected".to_string(),
            Outcome::SlowObserver => "observer too slow".to_string(),
        }
    }
}

/// Owns one session's process and pumps bytes between it and the observer
pub(crate) struct Relay {
    pub handle: Arc<SessionHandle>,
    pub process: Box<dyn Process>,
    pub observer: mpsc::Sender<SessionMessage>,
    pub commands: mpsc::Receiver<RelayCommand>,
    pub registry: Arc<DashMap<SessionId, Arc<SessionHandle>>>,
    pub send_timeout: Duration,
    pub kill_timeout: Duration,
}

impl Relay {
    pub async fn run(mut self) {
        let id = self.handle.id;
        let cancel = self.handle.cancel_token();
        let mut output = self.process.take_output();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let reason = self
                        .handle
                        .close_reason()
                        .unwrap_or_else(|| "requested".to_string());
                    break Outcome::Requested(reason);
                }

                _ = self.observer.closed() => break Outcome::ObserverGone,

                Some(command) = self.commands.recv() => match command {
                    RelayCommand::Input(data) => {
                        tokio::select! {
                            result = self.process.write(data) => {
                                if let Err(e) = result {
                                    tracing::debug!("Dropped input for {}: {}", id, e);
                                }
                            }
                            _ = cancel.cancelled() => {}
                            _ = self.observer.closed() => {}
                        }
                    }
                    RelayCommand::Resize(size) => {
                        if let Err(e) = self.process.resize(size) {
                            tracing::debug!("Resize of {} failed: {}", id, e);
                        }
                    }
                },

                chunk = next_chunk(&mut output) => match chunk {
                    Some(chunk) => {
                        if let Some(outcome) = self.forward(chunk).await {
                            break outcome;
                        }
                    }
                    None => output = None,
                },

                exit = self.process.wait() => {
                    if !self.drain(&mut output).await {
                        break Outcome::ObserverGone;
                    }
                    break Outcome::Exited(exit);
                }
            }
        };

        self.teardown(outcome).await;
    }

    /// Send one output chunk; `Some` when the observer can no longer keep up
    async fn forward(&self, chunk: OutputChunk) -> Option<Outcome> {
        let message = SessionMessage::Output {
            data: chunk.data.to_vec(),
        };
        match self.observer.send_timeout(message, self.send_timeout).await {
            Ok(()) => None,
            Err(SendTimeoutError::Timeout(_)) => Some(Outcome::SlowObserver),
            Err(SendTimeoutError::Closed(_)) => Some(Outcome::ObserverGone),
        }
    }

    /// Forward output still buffered after exit; false if the observer left
    async fn drain(&self, output: &mut Option<mpsc::Receiver<OutputChunk>>) -> bool {
        let Some(rx) = output.as_mut() else {
            return true;
        };
        let deadline = Instant::now() + DRAIN_TIMEOUT;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(chunk)) => match self.forward(chunk).await {
                    None => continue,
                    Some(Outcome::ObserverGone) => return false,
                    Some(_) => return true,
                },
                Ok(None) | Err(_) => return true,
            }
        }
    }

    async fn teardown(self, outcome: Outcome) {
        let id = self.handle.id;
        if !matches!(outcome, Outcome::Requested(_)) {
            self.handle.note_close_reason(&outcome.reason());
        }
        self.handle.begin_close();

        let exit = match &outcome {
            Outcome::Exited(exit) => Some(*exit),
            _ => {
                self.process.kill();
                match tokio::time::timeout(self.kill_timeout, self.process.wait()).await {
                    Ok(exit) => Some(exit),
                    Err(_) => {
                        tracing::warn!(
                            "Shell for {} (pid {:?}) not reaped within {:?}",
                            id,
                            self.process.pid(),
                            self.kill_timeout
                        );
                        None
                    }
                }
            }
        };

        if !matches!(outcome, Outcome::ObserverGone) {
            let ended = SessionMessage::Ended {
                exit_code: exit.and_then(|e| e.code),
                reason: outcome.reason(),
            };
            if self
                .observer
                .send_timeout(ended, self.send_timeout)
                .await
                .is_err()
            {
                tracing::debug!("Observer of {} missed the end notice", id);
            }
        }

        self.registry.remove(&id);
        if self.handle.mark_closed() {
            tracing::info!(
                "Session {} closed ({}, exit code {:?})",
                id,
                outcome.reason(),
                exit.and_then(|e| e.code)
            );
        }
    }
}
