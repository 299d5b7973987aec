//! Full-filesystem backup task

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use hd_core::config::JobsConfig;
use hd_core::traits::{OutputStream, Process, ProcessExit, ProcessSpec};
use hd_core::types::EventKind;

use super::handle::JobHandle;
use crate::events::{job_extra, EventHub};
use crate::process::next_chunk;

/// Top-level directories never archived (relative to the source root)
pub(crate) const EXCLUDED_SYSTEM_DIRS: &[&str] =
    &["proc", "sys", "dev", "run", "tmp", "var/tmp", "var/cache"];

/// Names excluded wherever they appear: caches, version control metadata
/// and dependency stores
pub(crate) const EXCLUDED_NAMES: &[&str] = &[".cache", ".git", "node_modules", ".npm", ".cargo/registry"];

/// GNU tar's closing line when it skipped unreadable files
const SKIPPED_ERRORS_MARKER: &str = "Exiting with failure status due to previous errors";
/// GNU tar's line for an error it could not continue past
const FATAL_MARKER: &str = "Error is not recoverable";

/// How long to keep reading stderr after tar exits
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// `--exclude` patterns for an archive of `config.source_root`
pub fn exclude_patterns(config: &JobsConfig) -> Vec<String> {
    let mut patterns: Vec<String> = EXCLUDED_SYSTEM_DIRS
        .iter()
        .map(|dir| format!("./{}", dir))
        .collect();
    patterns.extend(EXCLUDED_NAMES.iter().map(|name| name.to_string()));

    if let Ok(relative) = config.backup_dir.strip_prefix(&config.source_root) {
        if !relative.as_os_str().is_empty() {
            patterns.push(format!("./{}", relative.display()));
        }
    }

    patterns.extend(config.extra_excludes.iter().cloned());
    patterns
}

/// Command producing a gzip-compressed tar of the source root at `artifact`
pub fn archive_spec(config: &JobsConfig, artifact: &Path) -> ProcessSpec {
    let mut spec = ProcessSpec::new(config.tar_program.clone())
        .args(["--create", "--gzip", "--ignore-failed-read"])
        .arg("--file")
        .arg(artifact.display().to_string());

    // Exclusions are positional in GNU tar and must precede the members
    for pattern in exclude_patterns(config) {
        spec = spec.arg(format!("--exclude={}", pattern));
    }

    spec.arg("--directory")
        .arg(config.source_root.display().to_string())
        .arg(".")
        .env("LC_ALL", "C")
}

/// How an archive run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// The archive is usable; `skipped` when tar reported non-fatal read errors
    Complete { skipped: bool },
    Failed(String),
}

/// Decide whether a finished tar produced a usable archive
pub fn classify(exit: ProcessExit, stderr: &str, artifact_exists: bool) -> ArchiveOutcome {
    let detail = || {
        let tail = summarize(stderr);
        if tail.is_empty() {
            String::new()
        } else {
            format!(": {}", tail)
        }
    };

    match exit.code {
        Some(0) if artifact_exists => ArchiveOutcome::Complete { skipped: false },
        Some(0) => ArchiveOutcome::Failed("tar succeeded but the archive is missing".to_string()),
        // Files changed while being read
        Some(1) if artifact_exists => ArchiveOutcome::Complete { skipped: true },
        Some(2)
            if artifact_exists
                && stderr.contains(SKIPPED_ERRORS_MARKER)
                && !stderr.contains(FATAL_MARKER) =>
        {
            ArchiveOutcome::Complete { skipped: true }
        }
        Some(code) => ArchiveOutcome::Failed(format!("tar exited with status {}{}", code, detail())),
        None => ArchiveOutcome::Failed(format!("tar was terminated by a signal{}", detail())),
    }
}

/// Last few non-empty lines of `text`, joined
pub(crate) fn summarize(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(3);
    lines[start..].join("; ")
}

/// Bounded tail of a process's stderr
#[derive(Debug, Default)]
pub(crate) struct StderrTail {
    buf: Vec<u8>,
}

impl StderrTail {
    const LIMIT: usize = 8 * 1024;

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > Self::LIMIT {
            let excess = self.buf.len() - Self::LIMIT;
            self.buf.drain(..excess);
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

pub(crate) async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Drives one running archive process to a terminal status
pub(crate) struct BackupTask {
    pub handle: Arc<JobHandle>,
    pub process: Box<dyn Process>,
    pub artifact: PathBuf,
    pub events: Arc<EventHub>,
    pub sample_interval: Duration,
    pub persist_interval: Duration,
}

impl BackupTask {
    pub async fn run(mut self) {
        let id = self.handle.id();
        let mut output = self.process.take_output();
        let mut stderr = StderrTail::default();

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.sample_interval,
            self.sample_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_persist = Instant::now();

        let exit = loop {
            tokio::select! {
                chunk = next_chunk(&mut output) => match chunk {
                    Some(chunk) if chunk.stream == OutputStream::Stderr => stderr.push(&chunk.data),
                    Some(_) => {}
                    None => output = None,
                },

                _ = ticker.tick() => {
                    let size = file_size(&self.artifact).await.unwrap_or(0);
                    let record = self.handle.update(|r| { r.observe_size(size); }).await;
                    tracing::trace!("{} at {} bytes ({}%)", id, size, record.progress);

                    if last_persist.elapsed() >= self.persist_interval {
                        if let Err(e) = self.handle.persist().await {
                            tracing::warn!("Failed to persist progress of {}: {}", id, e);
                        }
                        last_persist = Instant::now();
                    }
                }

                exit = self.process.wait() => break exit,
            }
        };

        if let Some(rx) = output.as_mut() {
            while let Ok(Some(chunk)) = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, rx.recv()).await {
                if chunk.stream == OutputStream::Stderr {
                    stderr.push(&chunk.data);
                }
            }
        }

        let size = file_size(&self.artifact).await;
        let stderr = stderr.text();
        let now = hd_core::time::now();

        match classify(exit, &stderr, size.is_some()) {
            ArchiveOutcome::Complete { skipped } => {
                let size = size.unwrap_or(0);
                let committed = self
                    .handle
                    .commit(|r| {
                        r.current_size = size;
                        r.complete(now);
                    })
                    .await;

                match committed {
                    Ok(_) => {
                        if skipped {
                            tracing::warn!("{} completed with skipped files: {}", id, summarize(&stderr));
                        }
                        tracing::info!("Backup {} completed ({} bytes)", id, size);
                        let mut extra = job_extra(&id);
                        extra.insert("size".to_string(), size.into());
                        self.events.append(
                            EventKind::Success,
                            "Backup Completed",
                            format!("Backup {} completed ({} bytes)", id, size),
                            extra,
                        );
                    }
                    Err(e) => {
                        let detail = format!("could not record completion: {}", e);
                        self.handle.update(|r| r.fail(detail.clone(), now)).await;
                        self.report_failure(&detail);
                    }
                }
            }
            ArchiveOutcome::Failed(detail) => {
                if let Err(e) = self.handle.commit(|r| r.fail(detail.clone(), now)).await {
                    tracing::error!("Failed to persist failure of {}: {}", id, e);
                    self.handle.update(|r| r.fail(detail.clone(), now)).await;
                }
                self.report_failure(&detail);
            }
        }
    }

    fn report_failure(&self, detail: &str) {
        let id = self.handle.id();
        tracing::error!("Backup {} failed: {}", id, detail);
        self.events.append(
            EventKind::Error,
            "Backup Failed",
            format!("Backup {} failed: {}", id, detail),
            job_extra(&id),
        );
    }
}
