//! Single-instance lock for the daemon
//!
//! The lock is a PID file. A file naming a live process means another
//! daemon owns the host; a file naming a dead process is stale and is
//! taken over.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Read the PID recorded in `path`
///
/// `Ok(None)` if the file does not exist; `InvalidData` if it is malformed.
pub fn read_pid(path: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check whether a process with the given PID exists
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // EPERM means the process exists but belongs to someone else
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// PID of a live daemon holding `path`, if any
pub fn running_instance(path: &Path) -> Option<u32> {
    match read_pid(path) {
        Ok(Some(pid)) if pid != std::process::id() && is_process_alive(pid) => Some(pid),
        _ => None,
    }
}

/// Held for the daemon's lifetime; removes the PID file on drop
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock, replacing a stale PID file
    ///
    /// Fails with `AlreadyExists` when a live process holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();

        if let Some(pid) = running_instance(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("hostdeckd is already running (pid {})", pid),
            ));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove PID file {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_and_removes_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("hostdeckd.pid");

        {
            let lock = InstanceLock::acquire(&path).unwrap();
            assert_eq!(read_pid(lock.path()).unwrap(), Some(std::process::id()));
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_stale_pid_file_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostdeckd.pid");
        fs::write(&path, "999999999\n").unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_live_holder_blocks_acquire() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostdeckd.pid");

        // pid 1 always exists on unix
        fs::write(&path, "1\n").unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(running_instance(&path), Some(1));
    }

    #[test]
    fn test_malformed_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.pid");
        fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(
            read_pid(&path).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }
}
