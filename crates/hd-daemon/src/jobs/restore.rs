//! Restore-over-filesystem task

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hd_core::config::JobsConfig;
use hd_core::traits::{ProcessSpawner, ProcessSpec};
use hd_core::types::{EventKind, JobId};

use super::backup::summarize;
use super::handle::JobHandle;
use crate::events::{job_extra, EventHub};
use crate::process::run_collect;

/// Extraction has no natural bound; this only guards against a hung archiver
const EXTRACT_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);
const REBOOT_LIMIT: Duration = Duration::from_secs(60);

/// Command extracting `artifact` over the source root
pub fn extract_spec(config: &JobsConfig, artifact: &Path) -> ProcessSpec {
    ProcessSpec::new(config.tar_program.clone())
        .args(["--extract", "--gzip", "--preserve-permissions"])
        .arg("--file")
        .arg(artifact.display().to_string())
        .arg("--directory")
        .arg(config.source_root.display().to_string())
        .env("LC_ALL", "C")
}

/// The restore in flight, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ActiveRestore {
    pub restore: JobId,
    pub source: JobId,
}

/// Slot allowing a single restore at a time
#[derive(Debug, Clone, Default)]
pub(crate) struct RestoreSlot(Arc<Mutex<Option<ActiveRestore>>>);

impl RestoreSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveRestore>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot; `Err` carries the restore already running
    pub fn claim(&self, active: ActiveRestore) -> Result<RestoreGuard, ActiveRestore> {
        let mut slot = self.lock();
        if let Some(current) = slot.as_ref() {
            return Err(current.clone());
        }
        *slot = Some(active);
        Ok(RestoreGuard(self.clone()))
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<ActiveRestore> {
        self.lock().clone()
    }

    /// True when `id` is the backup being restored
    pub fn is_source(&self, id: &JobId) -> bool {
        self.lock().as_ref().is_some_and(|a| &a.source == id)
    }
}

/// Releases the restore slot when dropped
#[derive(Debug)]
pub(crate) struct RestoreGuard(RestoreSlot);

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// Extracts one archive and reboots the host
pub(crate) struct RestoreTask {
    pub handle: Arc<JobHandle>,
    pub source: JobId,
    pub artifact: PathBuf,
    pub config: JobsConfig,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub events: Arc<EventHub>,
    pub guard: RestoreGuard,
}

impl RestoreTask {
    pub async fn run(self) {
        let id = self.handle.id();

        if !self.config.restore_grace.is_zero() {
            tokio::time::sleep(self.config.restore_grace).await;
        }

        tracing::warn!("Extracting {:?} over {:?}", self.artifact, self.config.source_root);
        let spec = extract_spec(&self.config, &self.artifact);
        let result = run_collect(self.spawner.as_ref(), spec, EXTRACT_LIMIT).await;
        let now = hd_core::time::now();

        let failure = match result {
            Ok(collected) if collected.exit.success() => None,
            Ok(collected) => {
                let tail = summarize(&collected.stderr_lossy());
                Some(match collected.exit.code {
                    Some(code) if tail.is_empty() => format!("tar exited with status {}", code),
                    Some(code) => format!("tar exited with status {}: {}", code, tail),
                    None => "tar was terminated by a signal".to_string(),
                })
            }
            Err(e) => Some(e.to_string()),
        };

        let mut extra = job_extra(&id);
        extra.insert("sourceJobId".to_string(), self.source.to_string().into());

        if let Some(detail) = failure {
            let _ = self.handle.commit(|r| r.fail(detail.clone(), now)).await;
            tracing::error!("Restore {} from {} failed: {}", id, self.source, detail);
            self.events.append(
                EventKind::Error,
                "Restore Failed",
                format!("Restore from {} failed: {}", self.source, detail),
                extra,
            );
            return;
        }

        let _ = self.handle.commit(|r| r.complete(now)).await;
        tracing::info!("Restore {} from {} completed", id, self.source);
        self.events.append(
            EventKind::Success,
            "Restore Completed",
            format!("Restored {}; rebooting", self.source),
            extra.clone(),
        );

        // The slot stays claimed through the reboot; `self.guard` drops last
        self.reboot(extra).await;
    }

    async fn reboot(&self, extra: serde_json::Map<String, serde_json::Value>) {
        let Some((program, args)) = self.config.reboot_command.split_first() else {
            tracing::info!("No reboot command configured; skipping reboot");
            return;
        };

        let spec = ProcessSpec::new(program.clone()).args(args.iter().cloned());
        let detail = match run_collect(self.spawner.as_ref(), spec, REBOOT_LIMIT).await {
            Ok(collected) if collected.exit.success() => {
                tracing::warn!("Reboot requested");
                return;
            }
            Ok(collected) => format!(
                "{} exited with {:?}: {}",
                program,
                collected.exit.code,
                summarize(&collected.stderr_lossy())
            ),
            Err(e) => e.to_string(),
        };

        tracing::error!("Reboot failed: {}", detail);
        self.events.append(
            EventKind::Error,
            "Reboot Failed",
            format!("Restore completed but the reboot failed: {}", detail),
            extra,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::parse(s).unwrap()
    }

    #[test]
    fn test_extract_spec() {
        let config = JobsConfig {
            source_root: PathBuf::from("/srv"),
            ..JobsConfig::default()
        };
        let spec = extract_spec(&config, Path::new("/b/backup-x.tar.gz"));
        assert_eq!(
            spec.args,
            [
                "--extract",
                "--gzip",
                "--preserve-permissions",
                "--file",
                "/b/backup-x.tar.gz",
                "--directory",
                "/srv"
            ]
        );
    }

    #[test]
    fn test_slot_allows_one_restore() {
        let slot = RestoreSlot::default();
        let first = ActiveRestore {
            restore: id("restore-a"),
            source: id("backup-a"),
        };

        let guard = slot.claim(first.clone()).unwrap();
        assert!(slot.is_source(&id("backup-a")));
        assert!(!slot.is_source(&id("backup-b")));

        let second = ActiveRestore {
            restore: id("restore-b"),
            source: id("backup-b"),
        };
        assert_eq!(slot.claim(second.clone()).unwrap_err(), first);

        drop(guard);
        assert!(slot.current().is_none());
        assert!(slot.claim(second).is_ok());
    }
}
