//! Core domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::JobError;
use crate::time;

/// Identifier of a background job, e.g. `backup-2026-02-05T10-00-00`
///
/// Ids double as file stems inside the backup directory, so parsing rejects
/// anything that could name a path outside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Id for a job of `kind` created at `at`
    pub fn for_kind(kind: JobKind, at: DateTime<Utc>) -> Self {
        Self(format!("{}-{}", kind.as_str(), time::id_timestamp(at)))
    }

    /// Disambiguated variant for ids created within the same second
    pub fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}-{}", self.0, n))
    }

    /// Validate a caller-supplied id
    pub fn parse(s: &str) -> Result<Self, JobError> {
        let valid = !s.is_empty()
            && s.len() <= 128
            && !s.contains("..")
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(JobError::InvalidId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JobId {
    type Error = JobError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl FromStr for JobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Kind of maintenance job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle: `Pending -> Running -> {Completed | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Percent complete for `current` of `estimated`, capped at 99
pub fn progress_for(current: u64, estimated: u64) -> u8 {
    if estimated == 0 {
        return 0;
    }
    let pct = (current as f64 / estimated as f64 * 100.0).round();
    pct.clamp(0.0, 99.0) as u8
}

/// Status record of a job; also the on-disk sidecar format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    pub estimated_size: u64,
    pub current_size: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
    pub error: Option<String>,
    pub artifact: Option<PathBuf>,
    /// Backup a restore job extracts from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<JobId>,
}

impl JobRecord {
    pub fn new(id: JobId, kind: JobKind, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            status: JobStatus::Pending,
            progress: 0,
            estimated_size: 0,
            current_size: 0,
            created_at,
            completed_at: None,
            notes: String::new(),
            error: None,
            artifact: None,
            source: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(&mut self) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
        }
    }

    /// Record a size sample; returns true when progress advanced.
    ///
    /// Progress never moves backwards and never reaches 100 here.
    pub fn observe_size(&mut self, current: u64) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.current_size = current;
        let next = progress_for(current, self.estimated_size);
        if next > self.progress {
            self.progress = next;
            true
        } else {
            false
        }
    }

    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.error = None;
        self.completed_at = Some(at);
    }

    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(at);
        self.progress = self.progress.min(99);
    }
}

/// Identifier of an event, increasing in append order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Info,
    Warning,
    Error,
    Success,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Info => write!(f, "info"),
            EventKind::Warning => write!(f, "warning"),
            EventKind::Error => write!(f, "error"),
            EventKind::Success => write!(f, "success"),
        }
    }
}

/// A notification surfaced to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Which events a mark-read applies to: `"all"` or a single id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTarget {
    All,
    Event(EventId),
}

impl Serialize for ReadTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ReadTarget::All => serializer.serialize_str("all"),
            ReadTarget::Event(id) => serializer.serialize_u64(id.0),
        }
    }
}

impl<'de> Deserialize<'de> for ReadTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Id(u64),
            Word(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Id(id) => Ok(ReadTarget::Event(EventId(id))),
            Raw::Word(word) => word.parse().map_err(serde::de::Error::custom),
        }
    }
}

impl FromStr for ReadTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(ReadTarget::All);
        }
        s.parse::<u64>()
            .map(|id| ReadTarget::Event(EventId(id)))
            .map_err(|_| format!("expected an event id or \"all\", got {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 5, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_job_id_from_timestamp() {
        let id = JobId::for_kind(JobKind::Backup, at());
        assert_eq!(id.as_str(), "backup-2026-02-05T10-00-00");
        assert_eq!(id.with_suffix(2).as_str(), "backup-2026-02-05T10-00-00-2");
    }

    #[test]
    fn test_job_id_rejects_paths() {
        assert!(JobId::parse("backup-2026-02-05T10-00-00").is_ok());
        assert!(JobId::parse("../etc/passwd").is_err());
        assert!(JobId::parse("a/b").is_err());
        assert!(JobId::parse("a\\b").is_err());
        assert!(JobId::parse("..").is_err());
        assert!(JobId::parse("").is_err());
        assert!(serde_json::from_str::<JobId>(r#""x/../y""#).is_err());
    }

    #[test]
    fn test_progress_rounding_and_cap() {
        assert_eq!(progress_for(0, 1000), 0);
        assert_eq!(progress_for(125, 1000), 13);
        assert_eq!(progress_for(994, 1000), 99);
        assert_eq!(progress_for(5000, 1000), 99);
        assert_eq!(progress_for(10, 0), 0);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut record = JobRecord::new(JobId::for_kind(JobKind::Backup, at()), JobKind::Backup, at());
        record.estimated_size = 100;
        record.start();

        assert!(record.observe_size(40));
        assert_eq!(record.progress, 40);
        // Compression can shrink the observed size; progress holds
        assert!(!record.observe_size(30));
        assert_eq!(record.progress, 40);
        assert_eq!(record.current_size, 30);
        record.observe_size(1_000);
        assert_eq!(record.progress, 99);

        record.complete(at());
        assert_eq!(record.progress, 100);
        assert!(record.is_terminal());
    }

    #[test]
    fn test_record_wire_shape() {
        let mut record = JobRecord::new(JobId::for_kind(JobKind::Backup, at()), JobKind::Backup, at());
        record.fail("tar exited with status 2", at());

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["kind"], "backup");
        assert_eq!(value["estimatedSize"], 0);
        assert_eq!(value["error"], "tar exited with status 2");
        assert!(value.get("completedAt").is_some());
        assert!(value.get("source").is_none());
    }

    #[test]
    fn test_read_target_forms() {
        let all: ReadTarget = serde_json::from_str(r#""all""#).unwrap();
        assert_eq!(all, ReadTarget::All);
        let one: ReadTarget = serde_json::from_str("7").unwrap();
        assert_eq!(one, ReadTarget::Event(EventId(7)));
        assert!(serde_json::from_str::<ReadTarget>(r#""some""#).is_err());

        assert_eq!(serde_json::to_string(&ReadTarget::All).unwrap(), r#""all""#);
        assert_eq!("12".parse::<ReadTarget>().unwrap(), ReadTarget::Event(EventId(12)));
    }
}
