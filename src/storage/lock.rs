//! Advisory lock files scoped to a destination path.
//!
//! A lock for `dir/file.json` lives at `dir/file.json.lock` and records the
//! owning PID and acquisition time. Locks held by dead processes are stale
//! and get broken by the next acquirer.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, ErrorContext};

static LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Metadata stored in a lock file to identify the owning process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started: String,
}

/// Get the lock file path for a destination path.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

/// Read lock info if the lock file exists and its owner is still alive.
pub fn read_lock(path: &Path) -> Option<LockInfo> {
    let contents = fs::read_to_string(lock_path_for(path)).ok()?;
    let info: LockInfo = serde_json::from_str(&contents).ok()?;
    if !is_pid_alive(info.pid) {
        return None;
    }
    Some(info)
}

/// Held lock on a destination path. Released when dropped.
#[derive(Debug)]
pub struct PathLock {
    lock_path: PathBuf,
}

impl PathLock {
    /// Acquire the lock for `path`, polling every `poll` until `timeout`.
    pub async fn acquire(
        path: &Path,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Self, EngineError> {
        let lock_path = lock_path_for(path);
        let started = Instant::now();
        loop {
            match try_create(&lock_path) {
                Ok(true) => {
                    debug!(lock = %lock_path.display(), "Acquired path lock");
                    return Ok(Self { lock_path });
                }
                Ok(false) => {
                    if read_lock(path).is_none() {
                        // Owner is gone (or the file is unreadable): break it and retry at once.
                        warn!(lock = %lock_path.display(), "Breaking stale lock");
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                }
                Err(e) => return Err(EngineError::io("acquire_lock", &lock_path, e)),
            }
            if started.elapsed() >= timeout {
                return Err(EngineError::filesystem(
                    ErrorContext::new("acquire_lock"),
                    format!(
                        "timed out after {:?} waiting for {}",
                        timeout,
                        lock_path.display()
                    ),
                ));
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Publish a fully written lock file with a hard link, which fails if the
/// lock already exists. Readers never see an empty lock file.
fn try_create(lock_path: &Path) -> io::Result<bool> {
    let info = LockInfo {
        pid: std::process::id(),
        started: chrono::Utc::now().to_rfc3339(),
    };
    let json = serde_json::to_string(&info).map_err(io::Error::other)?;

    let seq = LOCK_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut staging = lock_path.as_os_str().to_owned();
    staging.push(format!(".{}.{}", info.pid, seq));
    let staging = PathBuf::from(staging);

    {
        let mut file = fs::File::create(&staging)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    let linked = fs::hard_link(&staging, lock_path);
    let _ = fs::remove_file(&staging);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Check whether a process with the given PID is still running.
///
/// `kill(pid, 0)` checks for existence without sending a signal. EPERM means
/// the process exists but belongs to another user.
#[cfg(unix)]
pub(crate) fn is_pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn is_pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/a/session-cache.json")),
            PathBuf::from("/tmp/a/session-cache.json.lock")
        );
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.json");

        let held = PathLock::acquire(&target, Duration::from_secs(1), Duration::from_millis(5))
            .await
            .unwrap();
        assert!(held.path().exists());
        assert_eq!(read_lock(&target).map(|i| i.pid), Some(std::process::id()));

        let second =
            PathLock::acquire(&target, Duration::from_millis(40), Duration::from_millis(5)).await;
        assert!(second.is_err());

        drop(held);
        assert!(!lock_path_for(&target).exists());
        let third = PathLock::acquire(&target, Duration::from_millis(40), Duration::from_millis(5))
            .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.json");
        // A PID this large never exists on Linux or macOS.
        let stale = LockInfo {
            pid: 999_999_999,
            started: "2020-01-01T00:00:00Z".to_string(),
        };
        fs::write(lock_path_for(&target), serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = PathLock::acquire(&target, Duration::from_millis(200), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(read_lock(&target).map(|i| i.pid), Some(std::process::id()));
        drop(lock);
    }

    #[test]
    fn test_current_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }
}
