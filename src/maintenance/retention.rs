//! Sliding-window retention for readings and backups.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backup::{BackupCoordinator, BackupError, CleanupReport};
use crate::storage::{SettingsStore, Store, StoreError};
use crate::types::Reading;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub readings_deleted: usize,
    pub backups: CleanupReport,
}

pub struct RetentionManager {
    store: Store,
    settings: Arc<SettingsStore>,
    backup: Arc<BackupCoordinator>,
}

impl RetentionManager {
    pub fn new(store: Store, settings: Arc<SettingsStore>, backup: Arc<BackupCoordinator>) -> Self {
        Self {
            store,
            settings,
            backup,
        }
    }

    /// Keep the `max_count` newest readings by `(timestamp, id)` and delete
    /// the rest in one batch. Returns how many were deleted.
    pub fn purge_excess_readings(&self, max_count: usize) -> Result<usize, StoreError> {
        let total = self.store.reading_count();
        if total <= max_count {
            tracing::debug!(total, max_count, "No reading purge needed");
            return Ok(0);
        }

        let mut readings = self.store.list_readings()?;
        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        let doomed: Vec<u64> = readings.iter().skip(max_count).map(|r: &Reading| r.id).collect();
        if let Some(oldest_kept) = readings.get(max_count.saturating_sub(1)) {
            tracing::info!(
                total,
                deleting = doomed.len(),
                oldest_kept = %oldest_kept.timestamp,
                "Purging old readings"
            );
        }
        self.store.delete_readings(&doomed)?;
        Ok(doomed.len())
    }

    /// Apply the current settings to both readings and backup artifacts.
    pub async fn enforce(&self) -> Result<RetentionReport, BackupError> {
        let settings = self.settings.get();
        let readings_deleted = self.purge_excess_readings(settings.max_reading_count())?;
        let backups = self
            .backup
            .cleanup(settings.retention_days(), settings.max_backup_count())
            .await?;
        Ok(RetentionReport {
            readings_deleted,
            backups,
        })
    }
}
