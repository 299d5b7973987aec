//! Session bridge behaviour against scripted and real processes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use hd_core::config::SessionSettings;
use hd_core::error::{ProcessError, SessionError};
use hd_core::traits::{OutputChunk, Process, ProcessExit, ProcessSpawner, ProcessSpec, SessionState};
use hd_daemon::process::ProcessRunner;
use hd_daemon::session::SessionBridge;
use hd_protocol::{SessionId, SessionMessage, TerminalSize};

/// Records input and stays alive until killed
struct ScriptedProcess {
    input: Arc<Mutex<Vec<u8>>>,
    kills: Arc<AtomicUsize>,
    output: Option<mpsc::Receiver<OutputChunk>>,
    _output_tx: mpsc::Sender<OutputChunk>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

#[async_trait]
impl Process for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn write(&self, data: Bytes) -> Result<(), ProcessError> {
        if self.exit_rx.borrow().is_some() {
            return Err(ProcessError::InputClosed);
        }
        self.input.lock().unwrap().extend_from_slice(&data);
        Ok(())
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<OutputChunk>> {
        self.output.take()
    }

    fn resize(&self, _size: TerminalSize) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = rx.wait_for(Option::is_some).await.ok().and_then(|s| *s);
        exit.unwrap_or(ProcessExit { code: None })
    }

    fn try_exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exit_tx.send_replace(Some(ProcessExit { code: None }));
    }
}

#[derive(Default, Clone)]
struct ScriptedSpawner {
    input: Arc<Mutex<Vec<u8>>>,
    kills: Arc<AtomicUsize>,
    /// Output feeds of spawned processes, in spawn order
    outputs: Arc<Mutex<Vec<mpsc::Sender<OutputChunk>>>>,
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(&self, _spec: ProcessSpec) -> Result<Box<dyn Process>, ProcessError> {
        let (output_tx, output_rx) = mpsc::channel(8);
        let (exit_tx, exit_rx) = watch::channel(None);
        self.outputs.lock().unwrap().push(output_tx.clone());
        Ok(Box::new(ScriptedProcess {
            input: Arc::clone(&self.input),
            kills: Arc::clone(&self.kills),
            output: Some(output_rx),
            _output_tx: output_tx,
            exit_tx,
            exit_rx,
        }))
    }
}

/// Real shells on pipes
struct PipedShells;

impl ProcessSpawner for PipedShells {
    fn spawn(&self, mut spec: ProcessSpec) -> Result<Box<dyn Process>, ProcessError> {
        spec.pty = None;
        ProcessRunner.spawn(spec)
    }
}

fn settings() -> SessionSettings {
    SessionSettings {
        shell: Some("/bin/sh".to_string()),
        kill_timeout: Duration::from_secs(1),
        ..SessionSettings::default()
    }
}

async fn wait_until_empty(bridge: &SessionBridge) {
    timeout(Duration::from_secs(5), async {
        while !bridge.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Session did not close in time");
}

/// Collect output until `ended`
async fn run_to_end(mut rx: mpsc::Receiver<SessionMessage>) -> (String, Option<i32>, String) {
    let mut output = Vec::new();
    loop {
        let message = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for session output")
            .expect("Channel closed before ended");
        match message {
            SessionMessage::Output { data } => output.extend_from_slice(&data),
            SessionMessage::Ended { exit_code, reason } => {
                return (String::from_utf8_lossy(&output).into_owned(), exit_code, reason)
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_input_is_delivered_in_order() {
    let spawner = ScriptedSpawner::default();
    let bridge = SessionBridge::new(settings(), Arc::new(spawner.clone()));
    let (tx, _rx) = mpsc::channel(16);

    let handle = bridge.open_session(tx, None).await.unwrap();
    for n in 0..100 {
        bridge
            .handle_input(handle.id, Bytes::from(format!("{},", n)))
            .await
            .unwrap();
    }

    let expected: String = (0..100).map(|n| format!("{},", n)).collect();
    timeout(Duration::from_secs(5), async {
        loop {
            if spawner.input.lock().unwrap().len() >= expected.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Input was not delivered");
    assert_eq!(
        String::from_utf8(spawner.input.lock().unwrap().clone()).unwrap(),
        expected
    );
}

#[tokio::test]
async fn test_dropping_observer_kills_process() {
    let spawner = ScriptedSpawner::default();
    let bridge = SessionBridge::new(settings(), Arc::new(spawner.clone()));
    let (tx, rx) = mpsc::channel(16);

    let handle = bridge.open_session(tx, None).await.unwrap();
    assert_eq!(handle.state(), SessionState::Active);

    drop(rx);
    wait_until_empty(&bridge).await;

    assert!(spawner.kills.load(Ordering::SeqCst) >= 1);
    assert_eq!(handle.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_slow_observer_does_not_stall_other_sessions() {
    let spawner = ScriptedSpawner::default();
    let settings = SessionSettings {
        send_timeout: Duration::from_secs(1),
        ..settings()
    };
    let bridge = SessionBridge::new(settings, Arc::new(spawner.clone()));

    // A's observer has room for one message and is never read
    let (tx_a, _rx_a) = mpsc::channel(1);
    let (tx_b, mut rx_b) = mpsc::channel(16);
    let a = bridge.open_session(tx_a, None).await.unwrap();
    let b = bridge.open_session(tx_b, None).await.unwrap();

    let (out_a, out_b) = {
        let outputs = spawner.outputs.lock().unwrap();
        (outputs[0].clone(), outputs[1].clone())
    };

    for n in 0..4 {
        let _ = out_a.send(OutputChunk::stdout(format!("a{}", n))).await;
    }
    out_b.send(OutputChunk::stdout("from b")).await.unwrap();

    // B is served while A is still stuck on its full queue
    let message = timeout(Duration::from_millis(500), rx_b.recv())
        .await
        .expect("B was held up by A's observer")
        .unwrap();
    assert_eq!(
        message,
        SessionMessage::Output {
            data: b"from b".to_vec()
        }
    );

    timeout(Duration::from_secs(5), async {
        while a.state() != SessionState::Closed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Slow session was not closed");

    assert_eq!(a.close_reason().as_deref(), Some("observer too slow"));
    assert!(spawner.kills.load(Ordering::SeqCst) >= 1);
    assert_eq!(b.state(), SessionState::Active);
    assert_eq!(bridge.len(), 1);
}

#[tokio::test]
async fn test_close_session_sends_single_ended() {
    let spawner = ScriptedSpawner::default();
    let bridge = SessionBridge::new(settings(), Arc::new(spawner));
    let (tx, rx) = mpsc::channel(16);

    let handle = bridge.open_session(tx, None).await.unwrap();
    assert!(bridge.close_session(handle.id, "operator"));
    bridge.close_session(handle.id, "again");

    let (_, exit_code, reason) = run_to_end(rx).await;
    assert_eq!(exit_code, None);
    assert_eq!(reason, "closed: operator");

    wait_until_empty(&bridge).await;
    assert!(!bridge.close_session(handle.id, "late"));
    assert_eq!(handle.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_unknown_sessions() {
    let bridge = SessionBridge::new(settings(), Arc::new(ScriptedSpawner::default()));

    assert!(matches!(
        bridge.handle_input(SessionId(99), Bytes::from_static(b"x")).await,
        Err(SessionError::NotFound(_))
    ));
    // Resizing a session that is gone is not an error
    assert!(bridge.handle_resize(SessionId(99), 40, 120).is_ok());
    assert!(matches!(
        bridge.handle_resize(SessionId(99), 0, 120),
        Err(SessionError::InvalidSize { .. })
    ));
}

#[tokio::test]
async fn test_invalid_size_is_rejected() {
    let bridge = SessionBridge::new(settings(), Arc::new(ScriptedSpawner::default()));
    let (tx, _rx) = mpsc::channel(16);

    let result = bridge.open_session(tx, Some(TerminalSize::new(0, 80))).await;
    assert!(matches!(result, Err(SessionError::InvalidSize { .. })));
    assert!(bridge.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_concurrent_sessions_are_isolated() {
    let bridge = SessionBridge::new(settings(), Arc::new(PipedShells));
    let (tx_a, rx_a) = mpsc::channel(64);
    let (tx_b, rx_b) = mpsc::channel(64);

    let a = bridge.open_session(tx_a, None).await.unwrap();
    let b = bridge.open_session(tx_b, None).await.unwrap();
    assert_ne!(a.id, b.id);

    bridge
        .handle_input(a.id, Bytes::from_static(b"echo AAAA\nexit 0\n"))
        .await
        .unwrap();
    bridge
        .handle_input(b.id, Bytes::from_static(b"echo BBBB\nexit 0\n"))
        .await
        .unwrap();

    let (out_a, code_a, reason_a) = run_to_end(rx_a).await;
    let (out_b, code_b, _) = run_to_end(rx_b).await;

    assert!(out_a.contains("AAAA") && !out_a.contains("BBBB"));
    assert!(out_b.contains("BBBB") && !out_b.contains("AAAA"));
    assert_eq!(code_a, Some(0));
    assert_eq!(code_b, Some(0));
    assert_eq!(reason_a, "process exited");

    wait_until_empty(&bridge).await;
}
