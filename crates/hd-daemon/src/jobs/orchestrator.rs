//! Job registry and lifecycle

use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use hd_core::config::JobsConfig;
use hd_core::error::JobError;
use hd_core::traits::ProcessSpawner;
use hd_core::types::{EventKind, JobId, JobKind, JobRecord, JobStatus};

use super::backup::{archive_spec, BackupTask};
use super::estimate::{available_bytes, estimate_backup_size};
use super::handle::JobHandle;
use super::restore::{ActiveRestore, RestoreSlot, RestoreTask};
use super::sidecar::{self, artifact_path, sidecar_path};
use crate::events::{job_extra, EventHub};

const INTERRUPTED: &str = "interrupted: the daemon stopped before the job finished";
const ORPHANED: &str = "interrupted: archive found without a status record";

/// Outcome of [`JobOrchestrator::reconcile`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records loaded from the backup directory
    pub loaded: usize,
    /// Records that were still pending or running
    pub interrupted: usize,
    /// Archives that had no usable record
    pub orphaned: usize,
}

/// Registry of backup and restore jobs
pub struct JobOrchestrator {
    jobs: DashMap<JobId, Arc<JobHandle>>,
    config: JobsConfig,
    spawner: Arc<dyn ProcessSpawner>,
    events: Arc<EventHub>,
    restores: RestoreSlot,
    /// Serializes id allocation, restore admission and deletion
    admission: Mutex<()>,
}

impl JobOrchestrator {
    pub fn new(config: JobsConfig, spawner: Arc<dyn ProcessSpawner>, events: Arc<EventHub>) -> Self {
        Self {
            jobs: DashMap::new(),
            config,
            spawner,
            events,
            restores: RestoreSlot::default(),
            admission: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Number of resident jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of resident jobs not yet finished
    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| !entry.value().snapshot().is_terminal())
            .count()
    }

    /// Start a backup of the source root
    ///
    /// Returns once the archiver is running and the job's record is on disk;
    /// the archive itself is produced in the background.
    pub async fn create_backup(&self, notes: Option<String>) -> Result<(JobId, u64), JobError> {
        let dir = &self.config.backup_dir;
        tokio::fs::create_dir_all(dir).await?;

        let handle = self.allocate_backup().await;
        let id = handle.id();
        let artifact = artifact_path(dir, &id);

        let estimate = estimate_backup_size(self.spawner.as_ref(), &self.config).await;
        handle
            .update(|r| {
                r.estimated_size = estimate;
                r.notes = notes.unwrap_or_default();
                r.artifact = Some(artifact.clone());
            })
            .await;

        if let Some(available) = available_bytes(dir) {
            if estimate > available {
                tracing::warn!(
                    "Backup {} needs about {} bytes but only {} are free",
                    id,
                    estimate,
                    available
                );
                let mut extra = job_extra(&id);
                extra.insert("estimatedSize".to_string(), estimate.into());
                extra.insert("availableBytes".to_string(), available.into());
                self.events.append(
                    EventKind::Warning,
                    "Low Disk Space",
                    format!(
                        "Backup {} needs about {} bytes but only {} are free on {}",
                        id,
                        estimate,
                        available,
                        dir.display()
                    ),
                    extra,
                );
            }
        }

        let process = match self.spawner.spawn(archive_spec(&self.config, &artifact)) {
            Ok(process) => process,
            Err(e) => {
                self.fail_before_start(&handle, e.to_string()).await;
                return Err(e.into());
            }
        };

        if let Err(e) = handle.commit(|r| r.start()).await {
            process.kill();
            // Reap before removing the partial archive
            let _ = process.wait().await;
            let _ = sidecar::remove_if_exists(&artifact).await;
            self.fail_before_start(&handle, format!("could not record job: {}", e))
                .await;
            return Err(e);
        }

        tracing::info!("Backup {} started (estimated {} bytes)", id, estimate);
        self.events.append(
            EventKind::Info,
            "Backup Started",
            format!("Backup {} started", id),
            job_extra(&id),
        );

        let task = BackupTask {
            handle,
            process,
            artifact,
            events: self.events.clone(),
            sample_interval: self.config.effective_sample_interval(),
            persist_interval: self.config.effective_persist_interval(),
        };
        tokio::spawn(task.run());

        Ok((id, estimate))
    }

    /// Reserve a fresh backup id and register its pending record
    async fn allocate_backup(&self) -> Arc<JobHandle> {
        let _admission = self.admission.lock().await;
        let now = hd_core::time::now();
        let base = JobId::for_kind(JobKind::Backup, now);

        let mut id = base.clone();
        let mut suffix = 2;
        while self.is_taken(&id).await {
            id = base.with_suffix(suffix);
            suffix += 1;
        }

        let sidecar = sidecar_path(&self.config.backup_dir, &id);
        let handle = Arc::new(JobHandle::new(
            JobRecord::new(id.clone(), JobKind::Backup, now),
            Some(sidecar),
        ));
        self.jobs.insert(id, handle.clone());
        handle
    }

    async fn is_taken(&self, id: &JobId) -> bool {
        let dir = &self.config.backup_dir;
        self.jobs.contains_key(id)
            || exists(&sidecar_path(dir, id)).await
            || exists(&artifact_path(dir, id)).await
    }

    async fn fail_before_start(&self, handle: &JobHandle, detail: String) {
        let id = handle.id();
        let now = hd_core::time::now();
        if let Err(e) = handle.commit(|r| r.fail(detail.clone(), now)).await {
            tracing::warn!("Failed to persist failure of {}: {}", id, e);
            handle.update(|r| r.fail(detail.clone(), now)).await;
        }

        tracing::error!("Backup {} failed to start: {}", id, detail);
        self.events.append(
            EventKind::Error,
            "Backup Failed",
            format!("Backup {} failed: {}", id, detail),
            job_extra(&id),
        );
    }

    /// Accept a restore of a completed backup; extraction starts after the
    /// grace delay and ends with a reboot
    pub async fn restore(&self, backup: &JobId) -> Result<JobId, JobError> {
        let _admission = self.admission.lock().await;

        let record = self.get_status(backup).await?;
        if record.kind != JobKind::Backup || record.status != JobStatus::Completed {
            return Err(JobError::Conflict(format!(
                "{} is a {} {} job and cannot be restored",
                backup, record.status, record.kind
            )));
        }

        let artifact = artifact_path(&self.config.backup_dir, backup);
        if !exists(&artifact).await {
            return Err(JobError::NotFound(format!("archive for {}", backup)));
        }

        let now = hd_core::time::now();
        let base = JobId::for_kind(JobKind::Restore, now);
        let mut id = base.clone();
        let mut suffix = 2;
        while self.jobs.contains_key(&id) {
            id = base.with_suffix(suffix);
            suffix += 1;
        }

        let guard = self
            .restores
            .claim(ActiveRestore {
                restore: id.clone(),
                source: backup.clone(),
            })
            .map_err(|active| {
                JobError::Conflict(format!(
                    "restore {} from {} is already running",
                    active.restore, active.source
                ))
            })?;

        let mut restore = JobRecord::new(id.clone(), JobKind::Restore, now);
        restore.start();
        restore.estimated_size = record.current_size;
        restore.source = Some(backup.clone());
        restore.artifact = Some(artifact.clone());

        // Restore records are not persisted; the host reboots when one succeeds
        let handle = Arc::new(JobHandle::new(restore, None));
        self.jobs.insert(id.clone(), handle.clone());

        tracing::warn!("Restore {} from {} accepted", id, backup);
        let mut extra = job_extra(&id);
        extra.insert("sourceJobId".to_string(), backup.to_string().into());
        self.events.append(
            EventKind::Info,
            "Restore Started",
            format!(
                "Restoring {}; the host will reboot when extraction finishes",
                backup
            ),
            extra,
        );

        let task = RestoreTask {
            handle,
            source: backup.clone(),
            artifact,
            config: self.config.clone(),
            spawner: self.spawner.clone(),
            events: self.events.clone(),
            guard,
        };
        tokio::spawn(task.run());

        Ok(id)
    }

    /// Current record: resident first, then the sidecar
    pub async fn get_status(&self, id: &JobId) -> Result<JobRecord, JobError> {
        if let Some(handle) = self.jobs.get(id).map(|entry| entry.value().clone()) {
            return Ok(handle.snapshot());
        }

        sidecar::read_record(&sidecar_path(&self.config.backup_dir, id))
            .await
            .filter(|record| &record.id == id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub async fn set_notes(&self, id: &JobId, notes: String) -> Result<JobRecord, JobError> {
        // A delete must not interleave with the sidecar rewrite
        let _admission = self.admission.lock().await;

        if let Some(handle) = self.jobs.get(id).map(|entry| entry.value().clone()) {
            return handle.commit(|r| r.notes = notes).await;
        }

        let path = sidecar_path(&self.config.backup_dir, id);
        let mut record = sidecar::read_record(&path)
            .await
            .filter(|record| &record.id == id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        record.notes = notes;
        sidecar::write_record(&path, &record).await?;
        Ok(record)
    }

    /// Remove a finished job with its archive and record
    pub async fn delete_job(&self, id: &JobId) -> Result<(), JobError> {
        let _admission = self.admission.lock().await;

        if self.restores.is_source(id) {
            return Err(JobError::Conflict(format!("{} is being restored", id)));
        }

        let resident = self.jobs.get(id).map(|entry| entry.value().snapshot());
        if let Some(record) = &resident {
            if !record.is_terminal() {
                return Err(JobError::Conflict(format!("{} is still {}", id, record.status)));
            }
        }

        let dir = &self.config.backup_dir;
        let removed_artifact = sidecar::remove_if_exists(&artifact_path(dir, id)).await?;
        let removed_sidecar = sidecar::remove_if_exists(&sidecar_path(dir, id)).await?;
        let removed_resident = self.jobs.remove(id).is_some();

        if !(removed_artifact || removed_sidecar || removed_resident) {
            return Err(JobError::NotFound(id.to_string()));
        }

        tracing::info!("Deleted job {}", id);
        Ok(())
    }

    /// All known jobs, newest first
    pub async fn list_jobs(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();

        match sidecar::scan(&self.config.backup_dir).await {
            Ok(scan) => {
                for id in scan.sidecars {
                    if self.jobs.contains_key(&id) {
                        continue;
                    }
                    let path = sidecar_path(&self.config.backup_dir, &id);
                    if let Some(record) = sidecar::read_record(&path).await {
                        if record.id == id {
                            records.push(record);
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to scan {:?}: {}", self.config.backup_dir, e),
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        records
    }

    /// Load the backup directory at startup
    ///
    /// Jobs left pending or running by a previous daemon, and archives with
    /// no record, are marked failed; their records are rewritten and an
    /// error event is raised for each.
    pub async fn reconcile(&self) -> Result<ReconcileReport, JobError> {
        let dir = self.config.backup_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;

        let scan = sidecar::scan(&dir).await?;
        let mut report = ReconcileReport::default();
        let now = hd_core::time::now();

        for id in scan.sidecars {
            let path = sidecar_path(&dir, &id);
            let Some(mut record) = sidecar::read_record(&path).await else {
                continue;
            };
            if record.id != id {
                tracing::warn!("Ignoring {:?}: it describes {}", path, record.id);
                continue;
            }

            if !record.is_terminal() {
                record.fail(INTERRUPTED, now);
                sidecar::write_record(&path, &record).await?;
                self.report_interrupted(&record);
                report.interrupted += 1;
            }

            self.jobs
                .insert(id, Arc::new(JobHandle::new(record, Some(path))));
            report.loaded += 1;
        }

        for id in scan.artifacts {
            if self.jobs.contains_key(&id) {
                continue;
            }

            let artifact = artifact_path(&dir, &id);
            let metadata = tokio::fs::metadata(&artifact).await?;
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(now);

            let mut record = JobRecord::new(id.clone(), JobKind::Backup, created_at);
            record.current_size = metadata.len();
            record.artifact = Some(artifact);
            record.fail(ORPHANED, now);

            let path = sidecar_path(&dir, &id);
            sidecar::write_record(&path, &record).await?;
            self.report_interrupted(&record);
            self.jobs
                .insert(id, Arc::new(JobHandle::new(record, Some(path))));
            report.orphaned += 1;
        }

        if report.interrupted + report.orphaned > 0 {
            tracing::warn!(
                "Marked {} interrupted and {} orphaned jobs as failed",
                report.interrupted,
                report.orphaned
            );
        }
        tracing::info!("Loaded {} jobs from {:?}", report.loaded + report.orphaned, dir);
        Ok(report)
    }

    fn report_interrupted(&self, record: &JobRecord) {
        self.events.append(
            EventKind::Error,
            "Backup Interrupted",
            format!(
                "Backup {} did not finish: {}",
                record.id,
                record.error.as_deref().unwrap_or(INTERRUPTED)
            ),
            job_extra(&record.id),
        );
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hd_core::config::EventsConfig;
    use tempfile::TempDir;

    use crate::process::ProcessRunner;

    fn orchestrator(dir: &TempDir) -> JobOrchestrator {
        let config = JobsConfig {
            backup_dir: dir.path().join("backups"),
            source_root: dir.path().join("root"),
            ..JobsConfig::default()
        };
        JobOrchestrator::new(
            config,
            Arc::new(ProcessRunner),
            Arc::new(EventHub::new(&EventsConfig::default())),
        )
    }

    fn backup_record(id: &str, status: JobStatus) -> JobRecord {
        let mut record = JobRecord::new(
            JobId::parse(id).unwrap(),
            JobKind::Backup,
            hd_core::time::now(),
        );
        record.status = status;
        record
    }

    async fn seed(orch: &JobOrchestrator, record: &JobRecord, with_artifact: bool) {
        let dir = &orch.config.backup_dir;
        tokio::fs::create_dir_all(dir).await.unwrap();
        sidecar::write_record(&sidecar_path(dir, &record.id), record)
            .await
            .unwrap();
        if with_artifact {
            tokio::fs::write(artifact_path(dir, &record.id), b"archive")
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_get_status_reads_sidecar() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        let record = backup_record("backup-a", JobStatus::Completed);
        seed(&orch, &record, true).await;

        assert_eq!(orch.get_status(&record.id).await.unwrap(), record);
        let missing = JobId::parse("backup-missing").unwrap();
        assert!(matches!(
            orch.get_status(&missing).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_notes_on_sidecar_job() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        let record = backup_record("backup-a", JobStatus::Completed);
        seed(&orch, &record, false).await;

        orch.set_notes(&record.id, "before upgrade".to_string())
            .await
            .unwrap();
        assert_eq!(
            orch.get_status(&record.id).await.unwrap().notes,
            "before upgrade"
        );
    }

    #[tokio::test]
    async fn test_notes_racing_delete_leave_no_record() {
        let tmp = TempDir::new().unwrap();
        let orch = Arc::new(orchestrator(&tmp));
        let dir = orch.config.backup_dir.clone();

        for n in 0..20 {
            let record = backup_record(&format!("backup-race-{}", n), JobStatus::Completed);
            seed(&orch, &record, true).await;
            let handle = Arc::new(JobHandle::new(
                record.clone(),
                Some(sidecar_path(&dir, &record.id)),
            ));
            orch.jobs.insert(record.id.clone(), handle);

            let (notes, deleted) = tokio::join!(
                {
                    let orch = Arc::clone(&orch);
                    let id = record.id.clone();
                    tokio::spawn(async move { orch.set_notes(&id, "late".to_string()).await })
                },
                {
                    let orch = Arc::clone(&orch);
                    let id = record.id.clone();
                    tokio::spawn(async move { orch.delete_job(&id).await })
                }
            );

            deleted.unwrap().unwrap();
            if let Err(e) = notes.unwrap() {
                assert!(matches!(e, JobError::NotFound(_)), "unexpected {:?}", e);
            }
            assert!(!sidecar_path(&dir, &record.id).exists());
            assert!(!artifact_path(&dir, &record.id).exists());
        }
    }

    #[tokio::test]
    async fn test_delete_removes_files() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        let record = backup_record("backup-a", JobStatus::Failed);
        seed(&orch, &record, true).await;

        orch.delete_job(&record.id).await.unwrap();
        let dir = &orch.config.backup_dir;
        assert!(!artifact_path(dir, &record.id).exists());
        assert!(!sidecar_path(dir, &record.id).exists());
        assert!(matches!(
            orch.delete_job(&record.id).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_running_is_conflict() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        let record = backup_record("backup-a", JobStatus::Running);
        orch.jobs
            .insert(record.id.clone(), Arc::new(JobHandle::new(record.clone(), None)));

        assert!(matches!(
            orch.delete_job(&record.id).await,
            Err(JobError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_requires_completed_backup() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        let failed = backup_record("backup-f", JobStatus::Failed);
        seed(&orch, &failed, true).await;
        assert!(matches!(
            orch.restore(&failed.id).await,
            Err(JobError::Conflict(_))
        ));

        let no_archive = backup_record("backup-n", JobStatus::Completed);
        seed(&orch, &no_archive, false).await;
        assert!(matches!(
            orch.restore(&no_archive.id).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_fails_interrupted_and_orphans() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        seed(&orch, &backup_record("backup-done", JobStatus::Completed), true).await;
        seed(&orch, &backup_record("backup-live", JobStatus::Running), true).await;
        let dir = orch.config.backup_dir.clone();
        tokio::fs::write(dir.join("backup-orphan.tar.gz"), b"partial")
            .await
            .unwrap();
        tokio::fs::write(dir.join("backup-junk.json"), b"{not json")
            .await
            .unwrap();

        let report = orch.reconcile().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                loaded: 2,
                interrupted: 1,
                orphaned: 1,
            }
        );

        let live = orch
            .get_status(&JobId::parse("backup-live").unwrap())
            .await
            .unwrap();
        assert_eq!(live.status, JobStatus::Failed);
        assert!(live.error.unwrap().starts_with("interrupted"));
        let on_disk = sidecar::read_record(&dir.join("backup-live.json")).await.unwrap();
        assert_eq!(on_disk.status, JobStatus::Failed);

        let orphan = orch
            .get_status(&JobId::parse("backup-orphan").unwrap())
            .await
            .unwrap();
        assert_eq!(orphan.status, JobStatus::Failed);
        assert_eq!(orphan.current_size, 7);

        let (events, _) = orch.events.list();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.title == "Backup Interrupted")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_list_jobs_newest_first() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp);
        let mut older = backup_record("backup-old", JobStatus::Completed);
        older.created_at = older.created_at - chrono::Duration::hours(1);
        let newer = backup_record("backup-new", JobStatus::Failed);
        seed(&orch, &older, false).await;
        seed(&orch, &newer, false).await;

        let ids: Vec<String> = orch
            .list_jobs()
            .await
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, ["backup-new", "backup-old"]);
    }
}
