//! Shared handle to one job's status record

use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex;

use hd_core::error::JobError;
use hd_core::types::{JobId, JobRecord};

use super::sidecar;

/// A job's record plus where it is persisted
///
/// Every mutation is serialized through `write_lock`. [`commit`] writes the
/// sidecar before the in-memory record changes, so readers never see a
/// status that is not yet durable.
///
/// [`commit`]: JobHandle::commit
#[derive(Debug)]
pub(crate) struct JobHandle {
    record: RwLock<JobRecord>,
    write_lock: Mutex<()>,
    /// `None` for jobs that only live in memory
    sidecar: Option<PathBuf>,
}

impl JobHandle {
    pub fn new(record: JobRecord, sidecar: Option<PathBuf>) -> Self {
        Self {
            record: RwLock::new(record),
            write_lock: Mutex::new(()),
            sidecar,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, JobRecord> {
        self.record.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobRecord> {
        self.record.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> JobId {
        self.read().id.clone()
    }

    pub fn snapshot(&self) -> JobRecord {
        self.read().clone()
    }

    /// Apply `f`, persist the result, then publish it
    pub async fn commit<F>(&self, f: F) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let _guard = self.write_lock.lock().await;

        let mut next = self.snapshot();
        f(&mut next);
        if let Some(path) = &self.sidecar {
            sidecar::write_record(path, &next).await?;
        }

        *self.write() = next.clone();
        Ok(next)
    }

    /// Apply `f` in memory only
    pub async fn update<F>(&self, f: F) -> JobRecord
    where
        F: FnOnce(&mut JobRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.write();
        f(&mut record);
        record.clone()
    }

    /// Write the current record to the sidecar
    pub async fn persist(&self) -> Result<(), JobError> {
        let _guard = self.write_lock.lock().await;
        if let Some(path) = &self.sidecar {
            let record = self.snapshot();
            sidecar::write_record(path, &record).await?;
        }
        Ok(())
    }
}
