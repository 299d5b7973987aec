//! IPC client for communicating with the daemon
//!
//! Uses TCP on localhost. Authenticates with the shared token when one is
//! configured. Event pushes that arrive while waiting for a response are
//! queued and handed out by [`DaemonClient::next_event`].

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use hd_core::ipc::{
    default_ipc_address, DaemonStatus, IpcEvent, IpcMessage, IpcRequest, IpcResponse, SessionInfo,
};
use hd_core::types::{Event as DeckEvent, EventId, JobRecord, ReadTarget};
use hd_protocol::{SessionId, SessionMessage, TerminalSize};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    /// Partial line kept across cancelled reads
    line: Vec<u8>,
}

impl Connection {
    async fn send<T: serde::Serialize>(&mut self, message: &T) -> Result<()> {
        let mut json = serde_json::to_string(message)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next non-empty line; `None` on EOF. Cancel safe.
    async fn recv_line(&mut self) -> Result<Option<String>> {
        loop {
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                return Ok(None);
            }
            if !self.line.ends_with(b"\n") {
                // EOF in the middle of a line
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&self.line).into_owned();
            self.line.clear();
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
    }
}

/// Client for communicating with the daemon
pub struct DaemonClient {
    address: String,
    token: Option<String>,
    conn: Option<Connection>,
    authenticated: bool,
    /// Pushes received while waiting for a response
    pending_events: VecDeque<IpcEvent>,
}

impl DaemonClient {
    /// Create a new client with the default address and no token
    pub fn new() -> Self {
        Self::with_address(default_ipc_address(), None)
    }

    /// Create a new client with a custom address
    pub fn with_address(address: String, token: Option<String>) -> Self {
        Self {
            address,
            token,
            conn: None,
            authenticated: false,
            pending_events: VecDeque::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect and authenticate
    pub async fn connect(&mut self) -> Result<()> {
        self.connect_without_auth().await?;

        if !self.authenticated {
            if let Some(token) = self.token.clone() {
                match self.send_request(IpcRequest::Authenticate { token }).await? {
                    IpcResponse::Authenticated => {
                        tracing::debug!("Authenticated with daemon");
                    }
                    IpcResponse::Error { message, .. } => {
                        anyhow::bail!("Authentication failed: {}", message)
                    }
                    other => anyhow::bail!("Unexpected authentication response: {:?}", other),
                }
            }
            self.authenticated = true;
        }

        Ok(())
    }

    async fn connect_without_auth(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        tracing::debug!("Connecting to daemon at {}", self.address);

        let stream = TcpStream::connect(&self.address).await.with_context(|| {
            format!(
                "Failed to connect to hostdeckd at {}. Is it running?",
                self.address
            )
        })?;
        let (reader, writer) = stream.into_split();
        self.conn = Some(Connection {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            line: Vec::new(),
        });
        Ok(())
    }

    /// Check if the daemon is running (no authentication required)
    pub async fn ping(&mut self) -> Result<bool> {
        self.connect_without_auth().await?;
        Ok(matches!(
            self.send_request(IpcRequest::Ping).await,
            Ok(IpcResponse::Pong)
        ))
    }

    pub async fn status(&mut self) -> Result<DaemonStatus> {
        match self.call(IpcRequest::GetStatus).await? {
            IpcResponse::Status(status) => Ok(status),
            other => unexpected(other),
        }
    }

    pub async fn list_sessions(&mut self) -> Result<Vec<SessionInfo>> {
        match self.call(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => unexpected(other),
        }
    }

    pub async fn close_session(&mut self, session_id: SessionId) -> Result<()> {
        self.call_ok(IpcRequest::CloseSession { session_id }).await
    }

    /// Start a backup; returns the job id and estimated size
    pub async fn create_backup(&mut self, notes: Option<String>) -> Result<(String, u64)> {
        match self.call(IpcRequest::CreateBackup { notes }).await? {
            IpcResponse::BackupCreated {
                job_id,
                estimated_size,
            } => Ok((job_id, estimated_size)),
            other => unexpected(other),
        }
    }

    pub async fn get_job(&mut self, job_id: &str) -> Result<JobRecord> {
        let request = IpcRequest::GetJob {
            job_id: job_id.to_string(),
        };
        match self.call(request).await? {
            IpcResponse::Job(record) => Ok(record),
            other => unexpected(other),
        }
    }

    pub async fn list_jobs(&mut self) -> Result<Vec<JobRecord>> {
        match self.call(IpcRequest::ListJobs).await? {
            IpcResponse::Jobs { jobs } => Ok(jobs),
            other => unexpected(other),
        }
    }

    /// Request a restore; returns the restore job id
    pub async fn restore(&mut self, job_id: &str) -> Result<String> {
        let request = IpcRequest::Restore {
            job_id: job_id.to_string(),
        };
        match self.call(request).await? {
            IpcResponse::RestoreAccepted { job_id, .. } => Ok(job_id),
            other => unexpected(other),
        }
    }

    pub async fn delete_job(&mut self, job_id: &str) -> Result<()> {
        self.call_ok(IpcRequest::DeleteJob {
            job_id: job_id.to_string(),
        })
        .await
    }

    pub async fn set_notes(&mut self, job_id: &str, notes: &str) -> Result<()> {
        self.call_ok(IpcRequest::SetJobNotes {
            job_id: job_id.to_string(),
            notes: notes.to_string(),
        })
        .await
    }

    /// Events newest first, with the unread count
    pub async fn list_events(&mut self) -> Result<(Vec<DeckEvent>, usize)> {
        match self.call(IpcRequest::ListEvents).await? {
            IpcResponse::Events {
                events,
                unread_count,
            } => Ok((events, unread_count)),
            other => unexpected(other),
        }
    }

    pub async fn mark_read(&mut self, target: ReadTarget) -> Result<()> {
        self.call_ok(IpcRequest::MarkEventsRead { target }).await
    }

    pub async fn delete_event(&mut self, event_id: EventId) -> Result<()> {
        self.call_ok(IpcRequest::DeleteEvent { event_id }).await
    }

    pub async fn clear_events(&mut self) -> Result<()> {
        self.call_ok(IpcRequest::ClearEvents).await
    }

    /// Start receiving event pushes; read them with [`next_event`]
    ///
    /// [`next_event`]: DaemonClient::next_event
    pub async fn subscribe_events(&mut self) -> Result<()> {
        match self.call(IpcRequest::SubscribeEvents).await? {
            IpcResponse::Subscribed => Ok(()),
            other => unexpected(other),
        }
    }

    /// Next pushed event; `None` when the daemon closes the connection
    pub async fn next_event(&mut self) -> Result<Option<IpcEvent>> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(Some(event));
        }

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;
        loop {
            let Some(line) = conn.recv_line().await? else {
                return Ok(None);
            };
            match IpcMessage::from_bytes(line.as_bytes()) {
                Ok(IpcMessage::Event(event)) => return Ok(Some(event)),
                Ok(other) => tracing::debug!("Ignoring unsolicited message: {:?}", other),
                Err(e) => tracing::warn!("Unparsable line from daemon: {}", e),
            }
        }
    }

    /// Stop the daemon
    pub async fn shutdown(&mut self) -> Result<()> {
        self.call_ok(IpcRequest::Shutdown).await
    }

    /// Attach a new shell; the connection is handed to the session
    pub async fn open_session(mut self, size: Option<TerminalSize>) -> Result<TerminalSession> {
        let request = IpcRequest::OpenSession {
            rows: size.map(|s| s.rows),
            cols: size.map(|s| s.cols),
        };

        match self.call(request).await? {
            IpcResponse::SessionOpened { session_id, size } => {
                let conn = self
                    .conn
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("No connection"))?;
                Ok(TerminalSession {
                    session_id,
                    size,
                    conn,
                })
            }
            other => unexpected(other),
        }
    }

    /// Connect, send, and turn an error response into an error
    async fn call(&mut self, request: IpcRequest) -> Result<IpcResponse> {
        self.connect().await?;

        match self.send_request(request).await? {
            IpcResponse::Error { kind, message } => anyhow::bail!("{} ({})", message, kind),
            response => Ok(response),
        }
    }

    async fn call_ok(&mut self, request: IpcRequest) -> Result<()> {
        match self.call(request).await? {
            IpcResponse::Ok => Ok(()),
            other => unexpected(other),
        }
    }

    async fn send_request(&mut self, request: IpcRequest) -> Result<IpcResponse> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;
        conn.send(&request).await?;

        loop {
            let line = conn
                .recv_line()
                .await?
                .ok_or_else(|| anyhow::anyhow!("Daemon closed the connection"))?;

            match IpcMessage::from_bytes(line.as_bytes())
                .with_context(|| format!("Invalid message from daemon: {}", line.trim()))?
            {
                IpcMessage::Response(response) => return Ok(response),
                IpcMessage::Event(event) => self.pending_events.push_back(event),
                IpcMessage::Request(request) => {
                    tracing::debug!("Ignoring request from daemon: {:?}", request)
                }
            }
        }
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected<T>(response: IpcResponse) -> Result<T> {
    anyhow::bail!("Unexpected response: {:?}", response)
}

/// Restores cooked mode when dropped
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode().context("Failed to enter raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Stops the terminal event thread when dropped
struct EventThread(Arc<AtomicBool>);

impl Drop for EventThread {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// How an interactive session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user pressed Ctrl+]
    Detached,
    /// The daemon ended the session
    Ended {
        exit_code: Option<i32>,
        reason: String,
    },
    /// The connection dropped without an end notice
    Disconnected,
}

/// Interactive terminal session handler
pub struct TerminalSession {
    session_id: SessionId,
    size: TerminalSize,
    conn: Connection,
}

impl TerminalSession {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Run the interactive terminal session
    ///
    /// Returns when the user detaches (Ctrl+]) or the session ends.
    /// Detaching closes the connection, which ends the shell.
    pub async fn run(mut self) -> Result<SessionEnd> {
        let _raw = RawModeGuard::enable()?;
        let mut stdout = std::io::stdout();

        if let Ok((cols, rows)) = crossterm::terminal::size() {
            if (rows, cols) != (self.size.rows, self.size.cols) {
                self.conn.send(&SessionMessage::Resize { rows, cols }).await?;
            }
        }

        // Terminal events are read on a plain thread; crossterm polling blocks
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
        let stop = Arc::new(AtomicBool::new(false));
        let _events = EventThread(Arc::clone(&stop));
        std::thread::Builder::new()
            .name("terminal-events".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    match event::poll(Duration::from_millis(50)) {
                        Ok(true) => match event::read() {
                            Ok(evt) => {
                                if event_tx.blocking_send(evt).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        },
                        Ok(false) => {}
                        Err(_) => break,
                    }
                }
            })
            .context("Failed to start terminal event thread")?;

        loop {
            tokio::select! {
                Some(evt) = event_rx.recv() => match evt {
                    Event::Key(key) => {
                        if is_detach(&key) {
                            return Ok(SessionEnd::Detached);
                        }
                        if key.kind == KeyEventKind::Release {
                            continue;
                        }
                        let data = key_to_bytes(key.code, key.modifiers);
                        if !data.is_empty() {
                            self.conn.send(&SessionMessage::Input { data }).await?;
                        }
                    }
                    Event::Paste(text) => {
                        self.conn
                            .send(&SessionMessage::Input { data: text.into_bytes() })
                            .await?;
                    }
                    Event::Resize(cols, rows) => {
                        self.conn.send(&SessionMessage::Resize { rows, cols }).await?;
                    }
                    _ => {}
                },

                line = self.conn.recv_line() => {
                    let Some(line) = line? else {
                        return Ok(SessionEnd::Disconnected);
                    };
                    match serde_json::from_str::<SessionMessage>(&line) {
                        Ok(SessionMessage::Output { data }) => {
                            stdout.write_all(&data)?;
                            stdout.flush()?;
                        }
                        Ok(SessionMessage::Ended { exit_code, reason }) => {
                            return Ok(SessionEnd::Ended { exit_code, reason });
                        }
                        Ok(other) => tracing::debug!("Ignoring {:?}", other),
                        Err(e) => tracing::warn!("Invalid session message: {}", e),
                    }
                }
            }
        }
    }
}

/// Ctrl+] (reported as Ctrl+5 by some terminals)
fn is_detach(key: &KeyEvent) -> bool {
    key.kind != KeyEventKind::Release
        && key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char(']') | KeyCode::Char('5'))
}

/// Encode a key press the way a VT100-style terminal would
pub fn key_to_bytes(code: KeyCode, modifiers: KeyModifiers) -> Vec<u8> {
    const ESC: u8 = 0x1b;

    let mut bytes = match code {
        KeyCode::Char(c) if modifiers.contains(KeyModifiers::CONTROL) => {
            match c.to_ascii_lowercase() {
                c @ 'a'..='z' => vec![c as u8 - b'a' + 1],
                ' ' | '@' | '2' => vec![0x00],
                '[' | '3' => vec![ESC],
                '\\' | '4' => vec![0x1c],
                '^' | '6' => vec![0x1e],
                '_' | '7' => vec![0x1f],
                _ => return Vec::new(),
            }
        }
        KeyCode::Char(c) => c.to_string().into_bytes(),
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Esc => vec![ESC],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::F(n @ 1..=4) => vec![ESC, b'O', b'P' + (n - 1)],
        KeyCode::F(n @ 5..=12) => {
            const CODES: [&str; 8] = ["15", "17", "18", "19", "20", "21", "23", "24"];
            format!("\x1b[{}~", CODES[usize::from(n - 5)]).into_bytes()
        }
        _ => return Vec::new(),
    };

    // Alt prefixes the sequence with ESC
    if modifiers.contains(KeyModifiers::ALT) {
        bytes.insert(0, ESC);
    }
    bytes
}
