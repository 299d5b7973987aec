//! On-disk job files
//!
//! `<backup_dir>/<jobId>.tar.gz` is the archive and `<backup_dir>/<jobId>.json`
//! its status record. Records are replaced atomically so a crash leaves
//! either the previous or the new record, never a torn one.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use hd_core::error::JobError;
use hd_core::types::{JobId, JobRecord};

const ARTIFACT_SUFFIX: &str = ".tar.gz";
const SIDECAR_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".json.tmp";

pub fn artifact_path(dir: &Path, id: &JobId) -> PathBuf {
    dir.join(format!("{}{}", id, ARTIFACT_SUFFIX))
}

pub fn sidecar_path(dir: &Path, id: &JobId) -> PathBuf {
    dir.join(format!("{}{}", id, SIDECAR_SUFFIX))
}

/// Durably replace the record at `path`
pub async fn write_record(path: &Path, record: &JobRecord) -> Result<(), JobError> {
    let json = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension("json.tmp");

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;

    #[cfg(unix)]
    if let Some(dir) = path.parent() {
        // Persist the rename itself
        if let Ok(dir) = tokio::fs::File::open(dir).await {
            let _ = dir.sync_all().await;
        }
    }

    Ok(())
}

/// Read a record; missing or unparsable files count as absent
pub async fn read_record(path: &Path) -> Option<JobRecord> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("Failed to read {:?}: {}", path, e);
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!("Ignoring unparsable job record {:?}: {}", path, e);
            None
        }
    }
}

/// Remove a file, treating "already gone" as success; true if it existed
pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Job files found in the backup directory
#[derive(Debug, Default)]
pub struct DirScan {
    /// Ids with a `.json` record
    pub sidecars: Vec<JobId>,
    /// Ids with a `.tar.gz` archive
    pub artifacts: Vec<JobId>,
}

/// List job files; names that are not valid job ids are skipped.
/// Leftover temporary records from an interrupted write are removed.
pub async fn scan(dir: &Path) -> io::Result<DirScan> {
    let mut scan = DirScan::default();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if name.ends_with(TEMP_SUFFIX) {
            if let Err(e) = remove_if_exists(&entry.path()).await {
                tracing::debug!("Could not remove stale {:?}: {}", entry.path(), e);
            }
            continue;
        }

        let (stem, is_artifact) = if let Some(stem) = name.strip_suffix(ARTIFACT_SUFFIX) {
            (stem, true)
        } else if let Some(stem) = name.strip_suffix(SIDECAR_SUFFIX) {
            (stem, false)
        } else {
            continue;
        };

        match JobId::parse(stem) {
            Ok(id) if is_artifact => scan.artifacts.push(id),
            Ok(id) => scan.sidecars.push(id),
            Err(_) => tracing::debug!("Skipping {:?} in backup dir", name),
        }
    }

    scan.sidecars.sort();
    scan.artifacts.sort();
    Ok(scan)
}
