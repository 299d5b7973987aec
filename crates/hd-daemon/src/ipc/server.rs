//! IPC server implementation
//!
//! Listens on 127.0.0.1 only; connections from any other peer are dropped.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use hd_core::error::{ErrorKind, HdError};
use hd_core::ipc::{IpcEvent, IpcRequest, IpcResponse, SessionInfo};
use hd_core::types::JobId;
use hd_protocol::{decode_message, JsonLineCodec, ProtocolError, SessionMessage, TerminalSize};

use crate::events::{HubMessage, Subscription};
use crate::state::DaemonState;

type LineReader = FramedRead<OwnedReadHalf, JsonLineCodec>;
type LineWriter = FramedWrite<OwnedWriteHalf, JsonLineCodec>;

/// IPC server for CLI communication
///
/// Listens on localhost (127.0.0.1) only - not accessible from network.
pub struct IpcServer {
    /// Address to bind (127.0.0.1:port)
    pub address: String,
    state: Arc<DaemonState>,
    shutdown_token: CancellationToken,
}

impl IpcServer {
    pub fn new(address: String, state: Arc<DaemonState>, shutdown_token: CancellationToken) -> Self {
        Self {
            address,
            state,
            shutdown_token,
        }
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind IPC server to {}", self.address))
    }

    /// Bind and serve until the shutdown token is cancelled
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("IPC server listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Only accept connections from localhost
                    if !peer_addr.ip().is_loopback() {
                        tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                        continue;
                    }

                    tracing::debug!("IPC client connected from {}", peer_addr);
                    let state = Arc::clone(&self.state);
                    let shutdown_token = self.shutdown_token.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, state, shutdown_token).await {
                            tracing::warn!("IPC client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept IPC connection: {}", e);
                }
            }
        }

        tracing::info!("IPC server stopped");
        Ok(())
    }
}

/// State for a single IPC client connection
struct ClientState {
    authenticated: bool,
    subscription: Option<Subscription>,
}

impl ClientState {
    fn new(state: &DaemonState) -> Self {
        Self {
            authenticated: state.config.auth_token.is_none(),
            subscription: None,
        }
    }

    /// Next hub message; pending while not subscribed.
    /// `None` means the hub dropped this subscriber.
    async fn next_event(&mut self) -> Option<HubMessage> {
        match self.subscription.as_mut() {
            Some(subscription) => subscription.receiver.recv().await,
            None => std::future::pending().await,
        }
    }

    fn unsubscribe(&mut self, state: &DaemonState) -> bool {
        match self.subscription.take() {
            Some(subscription) => state.events.unsubscribe(subscription.id),
            None => false,
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<DaemonState>,
    shutdown_token: CancellationToken,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = FramedRead::new(reader, JsonLineCodec::new());
    let mut writer = FramedWrite::new(writer, JsonLineCodec::new());
    let mut client = ClientState::new(&state);

    let result = serve_client(&state, &mut client, &mut reader, &mut writer, &shutdown_token).await;
    client.unsubscribe(&state);
    result
}

async fn serve_client(
    state: &DaemonState,
    client: &mut ClientState,
    reader: &mut LineReader,
    writer: &mut LineWriter,
    shutdown_token: &CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => break,

            line = reader.next() => {
                let line = match line {
                    None => break, // EOF
                    Some(Ok(line)) => line,
                    Some(Err(e @ ProtocolError::LineTooLong { .. })) => {
                        let _ = writer
                            .send(&IpcResponse::error(ErrorKind::InvalidRequest, e.to_string()))
                            .await;
                        return Err(e.into());
                    }
                    Some(Err(e)) => return Err(e.into()),
                };

                let request = match decode_message::<IpcRequest>(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        writer
                            .send(&IpcResponse::error(
                                ErrorKind::InvalidRequest,
                                format!("Invalid request: {}", e),
                            ))
                            .await?;
                        continue;
                    }
                };

                if !client.authenticated && !request.is_public() {
                    writer
                        .send(&IpcResponse::error(
                            ErrorKind::Unauthorized,
                            "Authenticate before sending this request",
                        ))
                        .await?;
                    continue;
                }

                if let IpcRequest::OpenSession { rows, cols } = request {
                    // The connection belongs to the session from here on
                    client.unsubscribe(state);
                    let size = match (rows, cols) {
                        (None, None) => None,
                        (rows, cols) => {
                            let default = TerminalSize::default();
                            Some(TerminalSize::new(
                                rows.unwrap_or(default.rows),
                                cols.unwrap_or(default.cols),
                            ))
                        }
                    };
                    return run_session_channel(state, reader, writer, size).await;
                }

                let response = match dispatch(request, state, client, shutdown_token).await {
                    Ok(response) => response,
                    Err(e) => failure(e),
                };
                writer.send(&response).await?;
            }

            message = client.next_event() => {
                match message {
                    Some(message) => writer.send(&to_ipc_event(message)).await?,
                    None => {
                        // The hub dropped us for falling behind
                        client.subscription = None;
                        writer
                            .send(&IpcEvent::EventsDropped {
                                reason: "subscriber queue overflowed; subscribe again".to_string(),
                            })
                            .await?;
                    }
                }
            }
        }
    }

    Ok(())
}

fn to_ipc_event(message: HubMessage) -> IpcEvent {
    match message {
        HubMessage::Snapshot {
            events,
            unread_count,
        } => IpcEvent::EventsSnapshot {
            events,
            unread_count,
        },
        HubMessage::Appended(event) => IpcEvent::EventAppended(event),
    }
}

fn failure(e: HdError) -> IpcResponse {
    let kind = e.kind();
    let message = match e {
        HdError::Session(e) => e.to_string(),
        HdError::Job(e) => e.to_string(),
        HdError::Event(e) => e.to_string(),
        HdError::Process(e) => e.to_string(),
        other => other.to_string(),
    };
    tracing::debug!("IPC request failed ({}): {}", kind, message);
    IpcResponse::error(kind, message)
}

fn tokens_match(expected: &str, given: &str) -> bool {
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

async fn dispatch(
    request: IpcRequest,
    state: &DaemonState,
    client: &mut ClientState,
    shutdown_token: &CancellationToken,
) -> Result<IpcResponse, HdError> {
    let response = match request {
        IpcRequest::Ping => IpcResponse::Pong,

        IpcRequest::Authenticate { token } => match &state.config.auth_token {
            Some(expected) if !tokens_match(expected, &token) => {
                tracing::warn!("IPC client presented an invalid token");
                client.authenticated = false;
                IpcResponse::error(ErrorKind::Unauthorized, "Invalid token")
            }
            _ => {
                client.authenticated = true;
                IpcResponse::Authenticated
            }
        },

        IpcRequest::GetStatus => IpcResponse::Status(state.status()),

        IpcRequest::ListSessions => {
            let sessions: Vec<SessionInfo> =
                state.sessions.list().iter().map(|s| s.info()).collect();
            IpcResponse::Sessions { sessions }
        }

        IpcRequest::CloseSession { session_id } => {
            if state.sessions.close_session(session_id, "closed by operator") {
                IpcResponse::Ok
            } else {
                return Err(hd_core::error::SessionError::NotFound(session_id).into());
            }
        }

        // Intercepted by the connection loop
        IpcRequest::OpenSession { .. } => IpcResponse::error(
            ErrorKind::InvalidRequest,
            "open_session cannot be combined with other requests",
        ),

        IpcRequest::CreateBackup { notes } => {
            let (job_id, estimated_size) = state.jobs.create_backup(notes).await?;
            IpcResponse::BackupCreated {
                job_id: job_id.to_string(),
                estimated_size,
            }
        }

        IpcRequest::GetJob { job_id } => {
            let id = JobId::parse(&job_id)?;
            IpcResponse::Job(state.jobs.get_status(&id).await?)
        }

        IpcRequest::ListJobs => IpcResponse::Jobs {
            jobs: state.jobs.list_jobs().await,
        },

        IpcRequest::Restore { job_id } => {
            let source = JobId::parse(&job_id)?;
            let restore = state.jobs.restore(&source).await?;
            IpcResponse::RestoreAccepted {
                job_id: restore.to_string(),
                source: source.to_string(),
            }
        }

        IpcRequest::DeleteJob { job_id } => {
            let id = JobId::parse(&job_id)?;
            state.jobs.delete_job(&id).await?;
            IpcResponse::Ok
        }

        IpcRequest::SetJobNotes { job_id, notes } => {
            let id = JobId::parse(&job_id)?;
            state.jobs.set_notes(&id, notes).await?;
            IpcResponse::Ok
        }

        IpcRequest::SubscribeEvents => {
            // Resubscribing replaces the feed with a freshly primed one
            client.unsubscribe(state);
            client.subscription = Some(state.events.subscribe());
            IpcResponse::Subscribed
        }

        IpcRequest::UnsubscribeEvents => {
            client.unsubscribe(state);
            IpcResponse::Ok
        }

        IpcRequest::ListEvents => {
            let (events, unread_count) = state.events.list();
            IpcResponse::Events {
                events,
                unread_count,
            }
        }

        IpcRequest::MarkEventsRead { target } => {
            state.events.mark_read(target)?;
            IpcResponse::Ok
        }

        IpcRequest::DeleteEvent { event_id } => {
            state.events.delete(event_id)?;
            IpcResponse::Ok
        }

        IpcRequest::ClearEvents => {
            state.events.clear();
            IpcResponse::Ok
        }

        IpcRequest::Shutdown => {
            tracing::info!("Shutdown requested via IPC");
            shutdown_token.cancel();
            IpcResponse::Ok
        }
    };

    Ok(response)
}

/// Relay a session over this connection until it ends or the client leaves
async fn run_session_channel(
    state: &DaemonState,
    reader: &mut LineReader,
    writer: &mut LineWriter,
    size: Option<TerminalSize>,
) -> Result<()> {
    let (observer_tx, mut observer_rx) = mpsc::channel(state.config.sessions.output_queue.max(1));

    let handle = match state.sessions.open_session(observer_tx, size).await {
        Ok(handle) => handle,
        Err(e) => {
            writer.send(&failure(e.into())).await?;
            return Ok(());
        }
    };
    let id = handle.id;

    writer
        .send(&IpcResponse::SessionOpened {
            session_id: id,
            size: handle.size(),
        })
        .await?;

    loop {
        tokio::select! {
            message = observer_rx.recv() => {
                let Some(message) = message else { break };
                let ended = matches!(message, SessionMessage::Ended { .. });
                writer.send(&message).await?;
                if ended {
                    break;
                }
            }

            line = reader.next() => {
                let line = match line {
                    None => {
                        state.sessions.close_session(id, "client disconnected");
                        break;
                    }
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        state.sessions.close_session(id, "protocol error");
                        return Err(e.into());
                    }
                };

                match decode_message::<SessionMessage>(&line) {
                    Ok(SessionMessage::Input { data }) => {
                        if let Err(e) = state.sessions.handle_input(id, Bytes::from(data)).await {
                            tracing::debug!("Input for {} dropped: {}", id, e);
                        }
                    }
                    Ok(SessionMessage::Resize { rows, cols }) => {
                        if let Err(e) = state.sessions.handle_resize(id, rows, cols) {
                            tracing::debug!("Resize of {} rejected: {}", id, e);
                        }
                    }
                    Ok(other) => {
                        tracing::debug!("Ignoring outbound message from client of {}: {:?}", id, other);
                    }
                    Err(e) => {
                        tracing::debug!("Invalid session message for {}: {}", id, e);
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3cret", "s3creT"));
        assert!(!tokens_match("s3cret", "s3cret-longer"));
        assert!(!tokens_match("s3cret", ""));
    }
}
