//! IPC protocol between the CLI and the daemon
//!
//! JSON objects tagged by `type`, one per line, over TCP on 127.0.0.1.
//! Request, response and event tags are disjoint so a reader can decode
//! any line as an [`IpcMessage`].

use chrono::{DateTime, Utc};
use hd_protocol::{SessionId, TerminalSize};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{Event, EventId, JobRecord, ReadTarget};

/// Default localhost port of the control surface
pub const DEFAULT_IPC_PORT: u16 = 22240;

/// Default IPC address
pub fn default_ipc_address() -> String {
    format!("127.0.0.1:{}", DEFAULT_IPC_PORT)
}

/// IPC request from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Keepalive; never requires authentication
    Ping,

    /// Present the shared token
    Authenticate { token: String },

    /// Daemon status summary
    GetStatus,

    /// List interactive sessions
    ListSessions,

    /// Terminate a session by id
    CloseSession { session_id: SessionId },

    /// Attach a new shell to this connection.
    ///
    /// After a `session_opened` response the connection carries
    /// `SessionMessage` frames until the session ends.
    OpenSession {
        #[serde(default)]
        rows: Option<u16>,
        #[serde(default)]
        cols: Option<u16>,
    },

    /// Start a full backup
    CreateBackup {
        #[serde(default)]
        notes: Option<String>,
    },

    /// Status record of one job
    GetJob { job_id: String },

    /// All known jobs, newest first
    ListJobs,

    /// Restore the filesystem from a completed backup, then reboot
    Restore { job_id: String },

    /// Remove a finished job and its files
    DeleteJob { job_id: String },

    /// Replace a job's notes
    SetJobNotes { job_id: String, notes: String },

    /// Start receiving event pushes on this connection
    SubscribeEvents,

    /// Stop receiving event pushes
    UnsubscribeEvents,

    /// Current event log, newest first
    ListEvents,

    /// Mark one event, or all of them, as read
    MarkEventsRead { target: ReadTarget },

    /// Delete one event
    DeleteEvent { event_id: EventId },

    /// Delete every event
    ClearEvents,

    /// Stop the daemon
    Shutdown,
}

impl IpcRequest {
    /// Whether the request is allowed before authenticating
    pub fn is_public(&self) -> bool {
        matches!(self, IpcRequest::Ping | IpcRequest::Authenticate { .. })
    }
}

/// IPC response from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Pong,

    /// Generic success
    Ok,

    Authenticated,

    Status(DaemonStatus),

    Sessions { sessions: Vec<SessionInfo> },

    /// The connection is now a session channel
    SessionOpened {
        session_id: SessionId,
        size: TerminalSize,
    },

    BackupCreated {
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(rename = "estimatedSize")]
        estimated_size: u64,
    },

    Job(JobRecord),

    Jobs { jobs: Vec<JobRecord> },

    /// Restore accepted; extraction starts after the grace delay
    RestoreAccepted {
        #[serde(rename = "jobId")]
        job_id: String,
        source: String,
    },

    Subscribed,

    Events {
        events: Vec<Event>,
        #[serde(rename = "unreadCount")]
        unread_count: usize,
    },

    Error { kind: ErrorKind, message: String },
}

impl IpcResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Event pushed to subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcEvent {
    /// Full current log; first message after subscribing and after
    /// mark-read, delete and clear
    EventsSnapshot {
        events: Vec<Event>,
        #[serde(rename = "unreadCount")]
        unread_count: usize,
    },

    /// A newly appended event
    EventAppended(Event),

    /// The daemon stopped feeding this subscriber
    EventsDropped { reason: String },
}

/// Daemon status information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub running: bool,
    pub version: String,
    pub uptime_secs: u64,
    pub session_count: usize,
    pub job_count: usize,
    pub running_jobs: usize,
    pub event_count: usize,
    pub unread_events: usize,
    pub backup_dir: String,
}

/// Interactive session information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub pid: Option<u32>,
    pub shell: String,
    pub state: String,
    pub size: TerminalSize,
    pub created_at: DateTime<Utc>,
}

/// Any line on the control connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcMessage {
    Request(IpcRequest),
    Response(IpcResponse),
    Event(IpcEvent),
}

impl IpcMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<IpcRequest> for IpcMessage {
    fn from(req: IpcRequest) -> Self {
        IpcMessage::Request(req)
    }
}

impl From<IpcResponse> for IpcMessage {
    fn from(resp: IpcResponse) -> Self {
        IpcMessage::Response(resp)
    }
}

impl From<IpcEvent> for IpcMessage {
    fn from(event: IpcEvent) -> Self {
        IpcMessage::Event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    #[test]
    fn test_request_serialization() {
        let req = IpcRequest::SetJobNotes {
            job_id: "backup-2026-02-05T10-00-00".to_string(),
            notes: "before upgrade".to_string(),
        };

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""type":"set_job_notes""#));

        match serde_json::from_str(&json).unwrap() {
            IpcRequest::SetJobNotes { job_id, notes } => {
                assert_eq!(job_id, "backup-2026-02-05T10-00-00");
                assert_eq!(notes, "before upgrade");
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_open_session_size_is_optional() {
        let req: IpcRequest = serde_json::from_str(r#"{"type":"open_session"}"#).unwrap();
        assert!(matches!(
            req,
            IpcRequest::OpenSession {
                rows: None,
                cols: None
            }
        ));
    }

    #[test]
    fn test_mark_read_target() {
        let req: IpcRequest =
            serde_json::from_str(r#"{"type":"mark_events_read","target":"all"}"#).unwrap();
        assert!(matches!(
            req,
            IpcRequest::MarkEventsRead {
                target: ReadTarget::All
            }
        ));
    }

    #[test]
    fn test_backup_created_wire_shape() {
        let resp = IpcResponse::BackupCreated {
            job_id: "backup-x".to_string(),
            estimated_size: 1024,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["type"], "backup_created");
        assert_eq!(value["jobId"], "backup-x");
        assert_eq!(value["estimatedSize"], 1024);
    }

    #[test]
    fn test_error_response() {
        let resp = IpcResponse::error(ErrorKind::Conflict, "job is running");
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","kind":"conflict","message":"job is running"}"#
        );
    }

    #[test]
    fn test_untagged_message_picks_right_family() {
        let event = Event {
            id: EventId(1),
            kind: EventKind::Success,
            title: "Backup Completed".to_string(),
            message: "done".to_string(),
            created_at: Utc::now(),
            read: false,
            extra: Default::default(),
        };

        let line = serde_json::to_vec(&IpcEvent::EventAppended(event)).unwrap();
        assert!(matches!(
            IpcMessage::from_bytes(&line).unwrap(),
            IpcMessage::Event(IpcEvent::EventAppended(_))
        ));

        let line = serde_json::to_vec(&IpcResponse::Pong).unwrap();
        assert!(matches!(
            IpcMessage::from_bytes(&line).unwrap(),
            IpcMessage::Response(IpcResponse::Pong)
        ));

        let line = serde_json::to_vec(&IpcRequest::ListJobs).unwrap();
        assert!(matches!(
            IpcMessage::from_bytes(&line).unwrap(),
            IpcMessage::Request(IpcRequest::ListJobs)
        ));
    }

    #[test]
    fn test_public_requests() {
        assert!(IpcRequest::Ping.is_public());
        assert!(IpcRequest::Authenticate {
            token: String::new()
        }
        .is_public());
        assert!(!IpcRequest::Shutdown.is_public());
    }
}
