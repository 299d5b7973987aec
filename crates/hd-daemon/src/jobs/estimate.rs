//! Best-effort sizing for backups

use std::path::Path;

use hd_core::config::JobsConfig;
use hd_core::traits::{ProcessSpawner, ProcessSpec};

use super::backup::exclude_patterns;
use crate::process::run_collect;

/// Parse the total from `du -s` output (`<bytes>\t<path>`)
pub fn parse_du_total(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// The archive's exclude patterns rewritten for `du`.
///
/// tar anchors `./x` at the source root; du matches against the walked
/// path, so anchored patterns become absolute paths under the root.
pub fn du_excludes(config: &JobsConfig) -> Vec<String> {
    exclude_patterns(config)
        .into_iter()
        .map(|pattern| match pattern.strip_prefix("./") {
            Some(relative) => config.source_root.join(relative).display().to_string(),
            None => pattern,
        })
        .collect()
}

/// `du` over exactly what the archive will contain
pub fn estimate_spec(config: &JobsConfig) -> ProcessSpec {
    // No -x: tar crosses mount points too
    let mut spec = ProcessSpec::new("du").args(["-s", "-b"]);
    for pattern in du_excludes(config) {
        spec = spec.arg(format!("--exclude={}", pattern));
    }
    spec.arg(config.source_root.display().to_string())
        .env("LC_ALL", "C")
}

/// Expected archive size: apparent size of the source tree times the
/// configured compression ratio. Zero when the size cannot be determined.
pub async fn estimate_backup_size(spawner: &dyn ProcessSpawner, config: &JobsConfig) -> u64 {
    let spec = estimate_spec(config);

    let collected = match run_collect(spawner, spec, config.estimate_timeout).await {
        Ok(collected) => collected,
        Err(e) => {
            tracing::warn!("Size estimate unavailable: {}", e);
            return 0;
        }
    };

    // du exits non-zero on unreadable entries but still prints a total
    match parse_du_total(&collected.stdout_lossy()) {
        Some(total) => {
            let estimate = (total as f64 * config.estimate_ratio.max(0.0)).round() as u64;
            tracing::debug!(
                "Source tree {:?} is {} bytes, estimating {} compressed",
                config.source_root,
                total,
                estimate
            );
            estimate
        }
        None => {
            tracing::warn!(
                "Could not parse du output (exit {:?}): {}",
                collected.exit.code,
                collected.stderr_lossy().trim()
            );
            0
        }
    }
}

/// Free bytes available to unprivileged writers on the volume holding `path`
#[cfg(unix)]
pub fn available_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    let available = stat.f_bavail as u64 * stat.f_frsize as u64;
    Some(available)
}

#[cfg(not(unix))]
pub fn available_bytes(_path: &Path) -> Option<u64> {
    None
}
