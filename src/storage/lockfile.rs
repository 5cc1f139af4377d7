//! Scheduler pid file
//!
//! The running scheduler holds a pid file so a second scheduler refuses to
//! start, and so `stop`/`status` from another process can find it. The file
//! holds two lines: the pid and the RFC 3339 start time.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// Pid file name inside the pid directory.
pub const PID_FILE_NAME: &str = "gridwarden-scheduler.pid";

/// Contents of a pid file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl PidRecord {
    fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let pid = lines.next()?.trim().parse().ok()?;
        let started_at = lines
            .next()
            .and_then(|l| DateTime::parse_from_rfc3339(l.trim()).ok())
            .map(|t| t.with_timezone(&Utc));
        Some(Self { pid, started_at })
    }
}

pub fn pid_file_path(pid_dir: &Path) -> PathBuf {
    pid_dir.join(PID_FILE_NAME)
}

/// Read the pid file; `None` when missing or unparseable.
pub fn read_pid_file(path: &Path) -> Option<PidRecord> {
    fs::read_to_string(path).ok().as_deref().and_then(PidRecord::parse)
}

/// Whether `pid` is alive and looks like a gridwarden process.
#[cfg(target_os = "linux")]
pub fn is_scheduler_process(pid: u32) -> bool {
    match fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(cmdline) => String::from_utf8_lossy(&cmdline).contains("gridwarden"),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn is_scheduler_process(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence/permission check.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0
}

#[cfg(not(unix))]
pub fn is_scheduler_process(_pid: u32) -> bool {
    true
}

/// Exclusive claim on the scheduler pid file, released on drop.
#[derive(Debug)]
pub struct ProcessLock {
    lock_path: PathBuf,
    owned: bool,
}

impl ProcessLock {
    /// Write our pid into `<pid_dir>/gridwarden-scheduler.pid`.
    ///
    /// Fails if the file names a live gridwarden process; a stale file is
    /// replaced.
    pub fn acquire<P: AsRef<Path>>(pid_dir: P) -> Result<Self> {
        Self::acquire_at(pid_file_path(pid_dir.as_ref()), is_scheduler_process)
    }

    fn acquire_at(lock_path: PathBuf, is_alive: fn(u32) -> bool) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create pid directory: {}", parent.display()))?;
        }

        if lock_path.exists() {
            match read_pid_file(&lock_path) {
                Some(existing) if existing.pid != std::process::id() && is_alive(existing.pid) => {
                    bail!(
                        "Scheduler is already running (PID: {})\n\
                         If no scheduler is running, remove the stale pid file: {}",
                        existing.pid,
                        lock_path.display()
                    );
                }
                _ => {
                    tracing::info!(path = %lock_path.display(), "Removing stale scheduler pid file");
                    fs::remove_file(&lock_path).context("Failed to remove stale pid file")?;
                }
            }
        }

        let pid = std::process::id();
        let contents = format!("{pid}\n{}\n", Utc::now().to_rfc3339());
        fs::write(&lock_path, contents)
            .with_context(|| format!("Failed to write pid file: {}", lock_path.display()))?;

        tracing::debug!(pid, path = %lock_path.display(), "Acquired scheduler pid file");
        Ok(Self { lock_path, owned: true })
    }

    /// Remove the pid file (also done on drop).
    pub fn release(&mut self) {
        if self.owned {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                tracing::warn!("Failed to remove pid file: {}", e);
            } else {
                tracing::debug!(path = %self.lock_path.display(), "Released scheduler pid file");
            }
            self.owned = false;
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_writes_pid_and_start_time() {
        let temp_dir = tempdir().unwrap();
        let lock = ProcessLock::acquire(temp_dir.path()).unwrap();

        let record = read_pid_file(lock.path()).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert!(record.started_at.is_some());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = tempdir().unwrap();
        let lock_path;
        {
            let lock = ProcessLock::acquire(temp_dir.path()).unwrap();
            lock_path = lock.path().to_path_buf();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_stale_pid_file_replaced() {
        let temp_dir = tempdir().unwrap();
        let path = pid_file_path(temp_dir.path());
        fs::write(&path, "999999999\n").unwrap();

        let lock = ProcessLock::acquire_at(path, |_| false).unwrap();
        assert_eq!(read_pid_file(lock.path()).unwrap().pid, std::process::id());
    }

    #[test]
    fn test_live_pid_file_refused() {
        let temp_dir = tempdir().unwrap();
        let path = pid_file_path(temp_dir.path());
        fs::write(&path, "4242\n2025-01-01T00:00:00Z\n").unwrap();

        let err = ProcessLock::acquire_at(path.clone(), |_| true).unwrap_err();
        assert!(err.to_string().contains("4242"));
        // the other scheduler's file is left alone
        assert!(path.exists());
    }
}
