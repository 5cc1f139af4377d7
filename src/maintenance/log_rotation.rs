//! Size/age based rotation of the scheduler log file: `[logging].file`
//! when set, otherwise the file a detached scheduler's output goes to.
//!
//! Rotation is copy-then-truncate so the running scheduler keeps appending
//! to the same open file. Rotated copies are `<file>.1` (newest) through
//! `<file>.<keep>`.

use chrono::{DateTime, Duration, Utc};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRotator {
    path: PathBuf,
    max_bytes: u64,
    max_age: Duration,
    keep: usize,
}

impl LogRotator {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, max_age_days: u64, keep: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            max_age: i64::try_from(max_age_days)
                .ok()
                .and_then(Duration::try_days)
                .unwrap_or(Duration::MAX),
            keep: keep.max(1),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let logging = &config.logging;
        Self::new(
            config.scheduler_log_path(),
            logging.rotate_max_bytes,
            logging.rotate_max_age_days,
            logging.rotate_keep,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotated(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// When the file was last rotated; falls back to its creation time.
    fn last_rotation(&self, current: &fs::Metadata) -> Option<DateTime<Utc>> {
        fs::metadata(self.rotated(1))
            .and_then(|m| m.modified())
            .or_else(|_| current.created())
            .ok()
            .map(DateTime::<Utc>::from)
    }

    /// Rotate if the file is over size or older than the age limit.
    /// Returns whether a rotation happened.
    pub fn rotate_if_needed(&self, now: DateTime<Utc>) -> io::Result<bool> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if metadata.len() == 0 {
            return Ok(false);
        }

        let too_big = metadata.len() > self.max_bytes;
        let too_old = self
            .last_rotation(&metadata)
            .is_some_and(|at| now - at > self.max_age);
        if !(too_big || too_old) {
            return Ok(false);
        }

        self.rotate()?;
        tracing::info!(
            path = %self.path.display(),
            size_bytes = metadata.len(),
            by_size = too_big,
            "Log file rotated"
        );
        Ok(true)
    }

    fn rotate(&self) -> io::Result<()> {
        match fs::remove_file(self.rotated(self.keep)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        for n in (1..self.keep).rev() {
            let from = self.rotated(n);
            if from.exists() {
                fs::rename(&from, self.rotated(n + 1))?;
            }
        }
        fs::copy(&self.path, self.rotated(1))?;
        OpenOptions::new().write(true).open(&self.path)?.set_len(0)?;
        Ok(())
    }
}
