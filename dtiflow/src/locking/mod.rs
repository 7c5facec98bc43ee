//! Per-subject advisory locking.
//!
//! Acquisition takes a non-blocking exclusive `flock`-style lock on
//! `{work_root}/{subject}/.dtiflow.lock`. The returned guard releases the
//! lock on drop; the operating system releases it when the descriptor is
//! closed, so a crashed process never leaves a subject locked.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the lock file inside a subject's working directory.
pub const LOCK_FILE_NAME: &str = ".dtiflow.lock";

/// Diagnostics written into the lock file by the holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Host the holder runs on, when it can be determined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Subject being processed.
    pub subject: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Hands out per-subject locks under a working root.
#[derive(Debug, Clone)]
pub struct SubjectLockManager {
    work_root: PathBuf,
}

impl SubjectLockManager {
    /// Creates a manager for subjects under `work_root`.
    #[must_use]
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }

    /// Path of a subject's lock file.
    #[must_use]
    pub fn lock_path(&self, subject: &str) -> PathBuf {
        self.work_root.join(subject).join(LOCK_FILE_NAME)
    }

    /// Metadata left by the current or last holder of `subject`'s lock.
    #[must_use]
    pub fn holder(&self, subject: &str) -> Option<LockMetadata> {
        let body = std::fs::read_to_string(self.lock_path(subject)).ok()?;
        serde_json::from_str(&body).ok()
    }

    /// Attempts to lock `subject` without waiting.
    ///
    /// Returns `Ok(None)` if another holder has the lock.
    pub fn acquire(&self, subject: &str) -> std::io::Result<Option<SubjectLockGuard>> {
        let path = self.lock_path(subject);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut guard = SubjectLockGuard {
                    file: Some(file),
                    path,
                    subject: subject.to_string(),
                };
                guard.write_metadata();
                debug!(subject, "Acquired subject lock");
                Ok(Some(guard))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                warn!(
                    subject,
                    lock = %path.display(),
                    "Subject is locked by another pipeline instance; skipping"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Scoped ownership of a subject lock.
#[derive(Debug)]
pub struct SubjectLockGuard {
    file: Option<File>,
    path: PathBuf,
    subject: String,
}

impl SubjectLockGuard {
    /// The locked subject.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_metadata(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let meta = LockMetadata {
            pid: std::process::id(),
            host: hostname(),
            subject: self.subject.clone(),
            acquired_at: Utc::now(),
        };
        let Ok(body) = serde_json::to_vec_pretty(&meta) else {
            return;
        };
        let result = file
            .set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| file.write_all(&body))
            .and_then(|()| file.flush());
        if let Err(e) = result {
            // Metadata is diagnostic only; the lock itself is held.
            debug!(subject = %self.subject, error = %e, "Failed to write lock metadata");
        }
    }

    /// Releases the lock. Calling this more than once is harmless.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(subject = %self.subject, error = %e, "Failed to unlock subject");
            }
            debug!(subject = %self.subject, "Released subject lock");
        }
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

impl Drop for SubjectLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SubjectLockManager::new(dir.path());

        let guard = manager.acquire("sub-001").unwrap().unwrap();
        assert!(guard.path().exists());
        assert_eq!(guard.subject(), "sub-001");

        let body = std::fs::read_to_string(guard.path()).unwrap();
        let meta: LockMetadata = serde_json::from_str(&body).unwrap();
        assert_eq!(meta.pid, std::process::id());
    }

    #[test]
    fn test_second_acquire_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let first = SubjectLockManager::new(dir.path());
        let second = SubjectLockManager::new(dir.path());

        let held = first.acquire("sub-001").unwrap();
        assert!(held.is_some());

        let started = std::time::Instant::now();
        let contended = second.acquire("sub-001").unwrap();
        assert!(contended.is_none());
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        let holder = second.holder("sub-001").unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.subject, "sub-001");
        assert!(second.holder("sub-404").is_none());
    }

    #[test]
    fn test_concurrent_acquire_exactly_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let root = root.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let manager = SubjectLockManager::new(root);
                    barrier.wait();
                    let guard = manager.acquire("sub-007").unwrap();
                    let won = guard.is_some();
                    // Hold long enough for the other thread to attempt.
                    std::thread::sleep(std::time::Duration::from_millis(100));
                    drop(guard);
                    won
                })
            })
            .collect();

        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_release_on_drop_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SubjectLockManager::new(dir.path());

        {
            let _guard = manager.acquire("sub-002").unwrap().unwrap();
        }
        assert!(manager.acquire("sub-002").unwrap().is_some());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SubjectLockManager::new(dir.path());

        let mut guard = manager.acquire("sub-003").unwrap().unwrap();
        guard.release();
        guard.release();
        assert!(manager.acquire("sub-003").unwrap().is_some());
    }

    #[test]
    fn test_different_subjects_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SubjectLockManager::new(dir.path());

        let _a = manager.acquire("sub-001").unwrap().unwrap();
        assert!(manager.acquire("sub-002").unwrap().is_some());
    }
}
