//! IPC integration tests
//!
//! Runs the IPC server on a local port and talks to it over TCP.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use hd_core::config::DaemonConfig;
use hd_core::error::{ErrorKind, ProcessError};
use hd_core::ipc::{IpcEvent, IpcRequest, IpcResponse};
use hd_core::traits::{Process, ProcessSpawner, ProcessSpec};
use hd_core::types::{EventKind, ReadTarget};
use hd_daemon::ipc::IpcServer;
use hd_daemon::process::ProcessRunner;
use hd_daemon::DaemonState;
use hd_protocol::SessionMessage;
use tempfile::TempDir;

/// Base port for test servers - each test gets a unique offset
static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

fn get_test_port() -> u16 {
    let offset = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
    39400 + offset
}

/// Runs shells on pipes so tests do not need a terminal
struct PipedShells;

impl ProcessSpawner for PipedShells {
    fn spawn(&self, mut spec: ProcessSpec) -> Result<Box<dyn Process>, ProcessError> {
        spec.pty = None;
        ProcessRunner.spawn(spec)
    }
}

fn test_config(dir: &TempDir) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.ipc_port = get_test_port();
    config.pid_file = dir.path().join("hostdeckd.pid");
    config.sessions.shell = Some("/bin/sh".to_string());
    config.jobs.backup_dir = dir.path().join("backups");
    config.jobs.source_root = dir.path().join("root");
    config
}

struct TestServer {
    address: String,
    state: Arc<DaemonState>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(config: DaemonConfig) -> Self {
        let address = config.ipc_address();
        let state = Arc::new(DaemonState::with_spawners(
            config,
            Arc::new(PipedShells),
            Arc::new(ProcessRunner),
        ));
        let shutdown = CancellationToken::new();
        let server = IpcServer::new(address.clone(), Arc::clone(&state), shutdown.clone());
        let listener = server.bind().await.expect("Failed to bind test server");

        let handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            address,
            state,
            shutdown,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

/// IPC test client wrapper
struct TestClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
}

impl TestClient {
    async fn connect(address: &str) -> Self {
        let stream = TcpStream::connect(address)
            .await
            .expect("Failed to connect to IPC server");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    async fn send<T: serde::Serialize>(&mut self, message: &T) {
        let mut json = serde_json::to_string(message).expect("Failed to serialize");
        json.push('\n');
        self.send_raw(&json).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("Failed to write");
        self.writer.flush().await.expect("Failed to flush");
    }

    /// Next line, or `None` on EOF
    async fn recv_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for the server")
            .expect("Failed to read");
        (n > 0).then_some(line)
    }

    async fn recv<T: DeserializeOwned>(&mut self) -> T {
        let line = self
            .recv_line()
            .await
            .expect("Server closed the connection");
        serde_json::from_str(&line).unwrap_or_else(|e| panic!("Unexpected line {:?}: {}", line, e))
    }

    async fn request(&mut self, request: IpcRequest) -> IpcResponse {
        self.send(&request).await;
        self.recv().await
    }
}

fn error_kind(response: &IpcResponse) -> Option<ErrorKind> {
    match response {
        IpcResponse::Error { kind, .. } => Some(*kind),
        _ => None,
    }
}

#[tokio::test]
async fn test_ipc_ping_pong() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir)).await;
    let mut client = TestClient::connect(&server.address).await;

    let response = client.request(IpcRequest::Ping).await;
    assert!(matches!(response, IpcResponse::Pong));
}

#[tokio::test]
async fn test_ipc_get_status() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir)).await;
    let mut client = TestClient::connect(&server.address).await;

    match client.request(IpcRequest::GetStatus).await {
        IpcResponse::Status(status) => {
            assert!(status.running);
            assert_eq!(status.session_count, 0);
            assert_eq!(status.job_count, 0);
            assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
        }
        other => panic!("Unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_ipc_invalid_request() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir)).await;
    let mut client = TestClient::connect(&server.address).await;

    client.send_raw("{\"type\":\"no_such_request\"}\n").await;
    let response: IpcResponse = client.recv().await;
    assert_eq!(error_kind(&response), Some(ErrorKind::InvalidRequest));

    // The connection stays usable
    assert!(matches!(client.request(IpcRequest::Ping).await, IpcResponse::Pong));
}

#[tokio::test]
async fn test_ipc_requires_token_when_configured() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.auth_token = Some("s3cret".to_string());
    let server = TestServer::start(config).await;
    let mut client = TestClient::connect(&server.address).await;

    assert!(matches!(client.request(IpcRequest::Ping).await, IpcResponse::Pong));

    let response = client.request(IpcRequest::GetStatus).await;
    assert_eq!(error_kind(&response), Some(ErrorKind::Unauthorized));

    let response = client
        .request(IpcRequest::Authenticate {
            token: "wrong".to_string(),
        })
        .await;
    assert_eq!(error_kind(&response), Some(ErrorKind::Unauthorized));

    let response = client
        .request(IpcRequest::Authenticate {
            token: "s3cret".to_string(),
        })
        .await;
    assert!(matches!(response, IpcResponse::Authenticated));
    assert!(matches!(
        client.request(IpcRequest::GetStatus).await,
        IpcResponse::Status(_)
    ));
}

#[tokio::test]
async fn test_ipc_job_errors() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir)).await;
    let mut client = TestClient::connect(&server.address).await;

    let response = client
        .request(IpcRequest::GetJob {
            job_id: "../../etc/passwd".to_string(),
        })
        .await;
    assert_eq!(error_kind(&response), Some(ErrorKind::InvalidRequest));

    let response = client
        .request(IpcRequest::GetJob {
            job_id: "backup-2026-01-01T00-00-00".to_string(),
        })
        .await;
    assert_eq!(error_kind(&response), Some(ErrorKind::NotFound));

    let response = client
        .request(IpcRequest::DeleteJob {
            job_id: "backup-2026-01-01T00-00-00".to_string(),
        })
        .await;
    assert_eq!(error_kind(&response), Some(ErrorKind::NotFound));

    match client.request(IpcRequest::ListJobs).await {
        IpcResponse::Jobs { jobs } => assert!(jobs.is_empty()),
        other => panic!("Unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_ipc_event_feed() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir)).await;
    let events = &server.state.events;
    for n in 0..3 {
        events.append(EventKind::Info, format!("event {}", n), "", Default::default());
    }

    let mut client = TestClient::connect(&server.address).await;
    assert!(matches!(
        client.request(IpcRequest::SubscribeEvents).await,
        IpcResponse::Subscribed
    ));

    match client.recv::<IpcEvent>().await {
        IpcEvent::EventsSnapshot {
            events,
            unread_count,
        } => {
            assert_eq!(events.len(), 3);
            assert_eq!(events[0].title, "event 2");
            assert_eq!(unread_count, 3);
        }
        other => panic!("Expected a priming snapshot, got {:?}", other),
    }

    let appended = events.append(EventKind::Warning, "Low Disk Space", "", Default::default());
    match client.recv::<IpcEvent>().await {
        IpcEvent::EventAppended(event) => assert_eq!(event.id, appended.id),
        other => panic!("Expected the new event, got {:?}", other),
    }

    let response = client
        .request(IpcRequest::MarkEventsRead {
            target: ReadTarget::All,
        })
        .await;
    assert!(matches!(response, IpcResponse::Ok));
    match client.recv::<IpcEvent>().await {
        IpcEvent::EventsSnapshot { unread_count, .. } => assert_eq!(unread_count, 0),
        other => panic!("Expected a snapshot, got {:?}", other),
    }

    let response = client
        .request(IpcRequest::DeleteEvent {
            event_id: hd_core::types::EventId(999),
        })
        .await;
    assert_eq!(error_kind(&response), Some(ErrorKind::NotFound));

    assert!(matches!(
        client.request(IpcRequest::UnsubscribeEvents).await,
        IpcResponse::Ok
    ));
    assert_eq!(events.subscriber_count(), 0);
}

#[tokio::test]
async fn test_ipc_session_channel() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir)).await;
    let mut client = TestClient::connect(&server.address).await;

    let response = client
        .request(IpcRequest::OpenSession {
            rows: Some(30),
            cols: Some(100),
        })
        .await;
    let session_id = match response {
        IpcResponse::SessionOpened { session_id, size } => {
            assert_eq!((size.rows, size.cols), (30, 100));
            session_id
        }
        other => panic!("Unexpected response: {:?}", other),
    };
    assert!(server.state.sessions.get(session_id).is_some());

    client
        .send(&SessionMessage::Input {
            data: b"echo hello-session\nexit 7\n".to_vec(),
        })
        .await;

    let mut output = Vec::new();
    loop {
        match client.recv::<SessionMessage>().await {
            SessionMessage::Output { data } => output.extend_from_slice(&data),
            SessionMessage::Ended { exit_code, .. } => {
                assert_eq!(exit_code, Some(7));
                break;
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }
    assert!(String::from_utf8_lossy(&output).contains("hello-session"));

    // The daemon closes the channel after `ended`
    assert!(client.recv_line().await.is_none());
}

#[tokio::test]
async fn test_ipc_disconnect_closes_session() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir)).await;
    let mut client = TestClient::connect(&server.address).await;

    let response = client
        .request(IpcRequest::OpenSession {
            rows: None,
            cols: None,
        })
        .await;
    assert!(matches!(response, IpcResponse::SessionOpened { .. }));
    assert_eq!(server.state.sessions.len(), 1);

    drop(client);

    timeout(Duration::from_secs(5), async {
        while !server.state.sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Session was not closed after the client left");
}

#[tokio::test]
async fn test_ipc_shutdown_stops_server() {
    let dir = TempDir::new().unwrap();
    let mut server = TestServer::start(test_config(&dir)).await;
    let mut client = TestClient::connect(&server.address).await;

    assert!(matches!(
        client.request(IpcRequest::Shutdown).await,
        IpcResponse::Ok
    ));
    assert!(server.shutdown.is_cancelled());

    timeout(Duration::from_secs(5), &mut server.handle)
        .await
        .expect("Server did not stop")
        .expect("Server task panicked");
}
