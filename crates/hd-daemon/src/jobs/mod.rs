//! Background maintenance jobs
//!
//! A backup archives the source root into `<backup_dir>/<jobId>.tar.gz`
//! while a single task samples its size and keeps `<jobId>.json` current.
//! A restore extracts a completed backup over the source root and reboots.

mod backup;
mod estimate;
mod handle;
mod orchestrator;
mod restore;
mod sidecar;

pub use backup::{archive_spec, classify, exclude_patterns, ArchiveOutcome};
pub use estimate::{available_bytes, du_excludes, estimate_backup_size, estimate_spec, parse_du_total};
pub use orchestrator::{JobOrchestrator, ReconcileReport};
pub use restore::extract_spec;
pub use sidecar::{artifact_path, read_record, sidecar_path};
