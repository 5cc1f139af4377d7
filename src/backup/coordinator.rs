//! BackupCoordinator: gated, deduplicated, idempotent backups.
//!
//! Every request resolves a trigger reason first; without one it is a
//! no-op. The artifact name is derived from the current second and doubles
//! as the dedup key: a second request in the same second finds the record
//! and, if it succeeded, only associates its reading. A failed record is
//! retried in place.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::artifact::{artifact_name, extract_table, ArtifactError};
use super::dump::{DumpError, DumpTool};
use super::policy::ReasonPolicy;
use crate::clock::Clock;
use crate::config::BackupConfig;
use crate::storage::{SettingsStore, Store, StoreError};
use crate::types::{BackupRecord, BackupStatus, BackupSummary, Reading, TriggerReason};

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reading {0} not found")]
    UnknownReading(u64),
    #[error("invalid artifact name '{0}'")]
    InvalidArtifactName(String),
    #[error("backup artifact '{0}' not found")]
    ArtifactNotFound(String),
    #[error("backup artifact '{0}' is an external database export and cannot be restored")]
    ExportOnly(String),
    #[error("cannot read artifact '{name}': {source}")]
    ReadArtifact {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot restore from '{name}': {source}")]
    Artifact {
        name: String,
        #[source]
        source: ArtifactError,
    },
    #[error("cannot access backup directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackupError::Store(e) if e.is_transient())
    }
}

fn lookup_reading(store: &Store, id: u64) -> Result<Reading, BackupError> {
    store.require_reading(id).map_err(|e| match e {
        StoreError::ReadingNotFound(id) => BackupError::UnknownReading(id),
        other => BackupError::Store(other),
    })
}

/// Parameters of one `backup` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupRequest {
    pub reading_id: Option<u64>,
    pub force: bool,
    pub reason: Option<TriggerReason>,
    pub actor: Option<String>,
}

impl BackupRequest {
    /// Dataset-wide snapshot from the scheduler.
    pub fn scheduled() -> Self {
        Self {
            reason: Some(TriggerReason::Scheduled),
            ..Self::default()
        }
    }

    /// Operator-forced backup.
    pub fn manual(actor: Option<String>) -> Self {
        Self {
            force: true,
            actor,
            ..Self::default()
        }
    }

    /// Backup justified by a reading's own flags.
    pub fn for_reading(reading_id: u64) -> Self {
        Self {
            reading_id: Some(reading_id),
            ..Self::default()
        }
    }
}

/// Result of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub artifact_name: String,
    pub rows_restored: usize,
    /// Last id now handed out; the next reading gets `sequence + 1`.
    pub sequence: u64,
    pub schema_found: bool,
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired: Vec<String>,
    pub over_limit: Vec<String>,
    pub orphaned_records: Vec<String>,
}

impl CleanupReport {
    pub fn removed(&self) -> usize {
        self.expired.len() + self.over_limit.len()
    }
}

struct ArtifactFile {
    name: String,
    path: PathBuf,
    modified: DateTime<Utc>,
}

pub struct BackupCoordinator {
    store: Store,
    settings: Arc<SettingsStore>,
    dump: Arc<dyn DumpTool>,
    clock: Arc<dyn Clock>,
    policy: ReasonPolicy,
    dir: PathBuf,
    prefix: String,
    table: String,
    max_error_len: usize,
    /// Serialises the check-then-dump section within this process.
    in_flight: tokio::sync::Mutex<()>,
}

impl BackupCoordinator {
    pub fn new(
        config: &BackupConfig,
        store: Store,
        settings: Arc<SettingsStore>,
        dump: Arc<dyn DumpTool>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            settings,
            dump,
            clock,
            policy: ReasonPolicy::new(config.reason_order.clone()),
            dir: config.dir.clone(),
            prefix: config.artifact_prefix.clone(),
            table: config.table.clone(),
            max_error_len: config.max_error_len,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> &ReasonPolicy {
        &self.policy
    }

    /// Perform or skip a backup. `Ok(true)` when an artifact now exists for
    /// this request, `Ok(false)` when there was no reason to back up or the
    /// dump failed (the failure is recorded).
    pub async fn backup(&self, request: BackupRequest) -> Result<bool, BackupError> {
        let reading = request
            .reading_id
            .map(|id| lookup_reading(&self.store, id))
            .transpose()?;

        let Some(reason) = self
            .policy
            .resolve(request.force, request.reason, reading.as_ref())
        else {
            tracing::debug!(reading_id = ?request.reading_id, "No reason to back up");
            return Ok(false);
        };

        let guard = self.in_flight.lock().await;
        let now = self.clock.now();
        let name = artifact_name(&self.prefix, now);

        let mut record = match self.store.get_backup(&name)? {
            Some(existing) if existing.is_success() => {
                if let Some(reading) = &reading {
                    self.store.associate_reading(&name, reading.id)?;
                    self.store.mark_backup_triggered(reading.id)?;
                }
                tracing::info!(artifact = %name, reading_id = ?request.reading_id, "Backup already exists, associated");
                return Ok(true);
            }
            Some(failed) => {
                tracing::info!(artifact = %name, attempts = failed.attempts, "Retrying failed backup");
                failed
            }
            None => BackupRecord {
                id: self.store.next_backup_id()?,
                created_at: now,
                updated_at: now,
                artifact_name: name.clone(),
                status: BackupStatus::Failed,
                size_bytes: 0,
                trigger_reason: reason,
                error_message: None,
                created_by: None,
                triggered_by: Default::default(),
                attempts: 0,
                export_only: false,
            },
        };
        record.attempts += 1;
        record.trigger_reason = reason;
        if record.created_by.is_none() {
            record.created_by.clone_from(&request.actor);
        }

        let path = self.dir.join(&name);
        match self.run_dump(&path).await {
            Ok(size_bytes) => {
                record.record_success(size_bytes, now);
                record.export_only = !self.dump.restorable();
                if let Some(reading) = &reading {
                    record.triggered_by.insert(reading.id);
                }
                self.store.save_backup(&record)?;
                if let Some(reading) = &reading {
                    self.store.mark_backup_triggered(reading.id)?;
                }
                tracing::info!(
                    artifact = %name,
                    reason = %reason,
                    size_bytes,
                    tool = self.dump.tool_name(),
                    "Backup completed"
                );
                drop(guard);

                let settings = self.settings.get();
                if let Err(e) = self
                    .cleanup(settings.retention_days(), settings.max_backup_count())
                    .await
                {
                    tracing::warn!(error = %e, "Cleanup after backup failed");
                }
                Ok(true)
            }
            // the store itself failed, not the dump: leave no record and let
            // the caller's recovery path see the storage error
            Err(DumpError::Store(e)) if e.is_transient() => {
                remove_partial(&path).await;
                tracing::warn!(artifact = %name, error = %e, "Backup aborted by storage error");
                Err(BackupError::Store(e))
            }
            Err(e) => {
                let message = truncate(&e.to_string(), self.max_error_len);
                remove_partial(&path).await;
                record.record_failure(message.clone(), now);
                self.store.save_backup(&record)?;
                tracing::warn!(artifact = %name, reason = %reason, error = %message, "Backup failed");
                Ok(false)
            }
        }
    }

    /// Dump into `path` and return its size.
    async fn run_dump(&self, path: &Path) -> Result<u64, DumpError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| DumpError::BackupDir {
                path: self.dir.clone(),
                source,
            })?;
        self.dump.dump(path).await?;
        let metadata = tokio::fs::metadata(path).await.map_err(DumpError::Missing)?;
        Ok(metadata.len())
    }

    /// Back up on behalf of a reading unless it already triggered one.
    pub async fn check_and_backup_if_needed(&self, reading_id: u64) -> Result<bool, BackupError> {
        let reading = lookup_reading(&self.store, reading_id)?;
        if reading.backup_triggered {
            tracing::debug!(reading_id, "Reading already backed up");
            return Ok(false);
        }
        if !reading.is_anomaly() && !reading.is_abnormal_prediction() {
            return Ok(false);
        }
        self.backup(BackupRequest::for_reading(reading_id)).await
    }

    /// Replace all readings with the rows in `name`. All or nothing.
    /// Artifacts recorded as export-only are refused; files without a
    /// record are attempted.
    pub async fn restore(
        &self,
        name: &str,
        actor: Option<&str>,
    ) -> Result<RestoreSummary, BackupError> {
        let path = self.artifact_path(name)?;
        if self.store.get_backup(name)?.is_some_and(|r| r.export_only) {
            return Err(BackupError::ExportOnly(name.to_string()));
        }
        let sql = match tokio::fs::read_to_string(&path).await {
            Ok(sql) => sql,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::ArtifactNotFound(name.to_string()))
            }
            Err(source) => {
                return Err(BackupError::ReadArtifact {
                    name: name.to_string(),
                    source,
                })
            }
        };

        let extracted = extract_table(&sql, &self.table).map_err(|source| BackupError::Artifact {
            name: name.to_string(),
            source,
        })?;
        self.store.replace_readings(&extracted.rows)?;
        let summary = RestoreSummary {
            artifact_name: name.to_string(),
            rows_restored: extracted.rows.len(),
            sequence: self.store.reading_sequence()?,
            schema_found: extracted.schema_found,
        };
        tracing::info!(
            artifact = %name,
            rows = summary.rows_restored,
            sequence = summary.sequence,
            actor = ?actor,
            "Readings restored"
        );
        Ok(summary)
    }

    /// Delete an artifact and its record.
    pub async fn delete_artifact(&self, name: &str) -> Result<(), BackupError> {
        let path = self.artifact_path(name)?;
        let file_removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(source) => return Err(BackupError::Io { path, source }),
        };
        let record_removed = self.store.delete_backup(name)?.is_some();
        if !file_removed && !record_removed {
            return Err(BackupError::ArtifactNotFound(name.to_string()));
        }
        tracing::info!(artifact = %name, "Backup deleted");
        Ok(())
    }

    pub fn list_backups(&self) -> Result<Vec<BackupRecord>, BackupError> {
        Ok(self.store.list_backups()?)
    }

    pub fn summary(&self) -> Result<BackupSummary, BackupError> {
        Ok(BackupSummary::from_records(&self.store.list_backups()?))
    }

    /// Evict artifacts older than `retention_days`, then the oldest beyond
    /// `max_count`, then drop success records whose file is gone.
    pub async fn cleanup(
        &self,
        retention_days: u32,
        max_count: usize,
    ) -> Result<CleanupReport, BackupError> {
        let mut report = CleanupReport::default();
        let mut files = self.artifact_files().await?;

        // `None` when the window reaches past the earliest representable time
        let cutoff = Duration::try_days(i64::from(retention_days))
            .and_then(|window| self.clock.now().checked_sub_signed(window));
        let mut kept = Vec::with_capacity(files.len());
        for file in files.drain(..) {
            if cutoff.is_some_and(|cutoff| file.modified < cutoff) {
                if self.evict(&file).await? {
                    report.expired.push(file.name);
                }
            } else {
                kept.push(file);
            }
        }

        kept.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        for file in kept.iter().skip(max_count) {
            if self.evict(file).await? {
                report.over_limit.push(file.name.clone());
            }
        }

        for record in self.store.list_backups()? {
            if record.is_success() && !self.dir.join(&record.artifact_name).exists() {
                self.store.delete_backup(&record.artifact_name)?;
                report.orphaned_records.push(record.artifact_name);
            }
        }

        if report.removed() > 0 || !report.orphaned_records.is_empty() {
            tracing::info!(
                expired = report.expired.len(),
                over_limit = report.over_limit.len(),
                orphaned = report.orphaned_records.len(),
                "Backup cleanup"
            );
        }
        Ok(report)
    }

    /// Remove the file, then its record. `false` if the file could not be
    /// removed; the record is then left to match the file still on disk.
    async fn evict(&self, file: &ArtifactFile) -> Result<bool, BackupError> {
        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(artifact = %file.name, error = %e, "Failed to delete backup file");
                return Ok(false);
            }
        }
        self.store.delete_backup(&file.name)?;
        Ok(true)
    }

    /// Artifacts in the backup directory carrying our prefix.
    async fn artifact_files(&self) -> Result<Vec<ArtifactFile>, BackupError> {
        let io_err = |source| BackupError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let prefix = format!("{}_", self.prefix);
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || !name.ends_with(".sql") {
                continue;
            }
            let metadata = entry.metadata().await.map_err(io_err)?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().map_err(io_err)?;
            files.push(ArtifactFile {
                name,
                path: entry.path(),
                modified: DateTime::<Utc>::from(modified),
            });
        }
        Ok(files)
    }

    /// Resolve a bare artifact name inside the backup directory.
    fn artifact_path(&self, name: &str) -> Result<PathBuf, BackupError> {
        let invalid = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.contains('\0');
        if invalid {
            return Err(BackupError::InvalidArtifactName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

/// Cut `message` to at most `max_chars` characters.
fn truncate(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial artifact"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
        assert_eq!(truncate("äöüß", 2), "äö");
    }
}
