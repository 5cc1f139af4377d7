//! Persistent storage for readings, backup records and settings
//!
//! One sled database with three trees:
//! - `readings`: `Reading` rows keyed by big-endian id
//! - `backups`: `BackupRecord` rows keyed by artifact name (the dedup key)
//! - `meta`: id sequences and the settings record
//!
//! Values are JSON. Multi-row writes go through sled transactions so a
//! restore either fully replaces the readings or leaves them untouched.

pub mod lockfile;
pub mod settings;

pub use lockfile::ProcessLock;
pub use settings::SettingsStore;

use chrono::{DateTime, Utc};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, Transactional, TransactionalTree,
};
use std::path::Path;

use crate::types::{BackupRecord, NewReading, Reading, ScoreResult, Settings};

const READINGS_SEQ: &str = "seq:readings";
const BACKUPS_SEQ: &str = "seq:backups";
const SETTINGS_KEY: &str = "settings";

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("reading {0} not found")]
    ReadingNotFound(u64),
    #[error("backup record '{0}' not found")]
    BackupNotFound(String),
    #[error("reading {0} is already scored")]
    AlreadyScored(u64),
}

impl StoreError {
    /// I/O-class failures that a later attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Sled(sled::Error::Io(_)))
    }
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(e: TransactionError<StoreError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(inner) => StoreError::Sled(inner),
        }
    }
}

type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

fn abort<T>(e: impl Into<StoreError>) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(e.into()))
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

/// Handle to the gridwarden database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    readings: sled::Tree,
    backups: sled::Tree,
    meta: sled::Tree,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        tracing::info!(path = %path.display(), "Store opened");
        Self::from_db(db)
    }

    /// In-memory database that disappears on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            readings: db.open_tree("readings")?,
            backups: db.open_tree("backups")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    /// Called by the scheduler after a transient storage error. sled is an
    /// embedded engine with no connection to re-establish: this flushes the
    /// page cache to disk and re-reads the sequence counter, so an error
    /// that persists surfaces here instead of in the next job.
    pub fn recover_after_error(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        let sequence = self.reading_sequence()?;
        tracing::info!(sequence, "Store flushed and verified after storage error");
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn next_id(&self, seq: &str) -> Result<u64, StoreError> {
        let updated = self.meta.update_and_fetch(seq, |old| {
            let next = old.and_then(decode_u64).unwrap_or(0) + 1;
            Some(next.to_be_bytes().to_vec())
        })?;
        Ok(updated.as_deref().and_then(decode_u64).unwrap_or(1))
    }

    /// Last id handed out for readings (0 when none).
    pub fn reading_sequence(&self) -> Result<u64, StoreError> {
        Ok(self
            .meta
            .get(READINGS_SEQ)?
            .as_deref()
            .and_then(decode_u64)
            .unwrap_or(0))
    }

    // ========================================================================
    // Readings
    // ========================================================================

    /// Persist a new reading with the next id.
    pub fn insert_reading(
        &self,
        new: NewReading,
        timestamp: DateTime<Utc>,
    ) -> Result<Reading, StoreError> {
        let reading = Reading {
            id: self.next_id(READINGS_SEQ)?,
            timestamp,
            measurements: new.measurements,
            scoring: None,
            backup_triggered: false,
            is_manual: new.is_manual,
            created_by: new.created_by,
        };
        self.readings
            .insert(id_key(reading.id), serde_json::to_vec(&reading)?)?;
        tracing::debug!(reading_id = reading.id, manual = reading.is_manual, "Reading stored");
        Ok(reading)
    }

    pub fn get_reading(&self, id: u64) -> Result<Option<Reading>, StoreError> {
        match self.readings.get(id_key(id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn require_reading(&self, id: u64) -> Result<Reading, StoreError> {
        self.get_reading(id)?.ok_or(StoreError::ReadingNotFound(id))
    }

    /// Read-modify-write one reading in a transaction. An `Err` from
    /// `modify` aborts without writing.
    fn modify_reading<F>(&self, id: u64, modify: F) -> Result<Reading, StoreError>
    where
        F: Fn(&mut Reading) -> Result<(), StoreError>,
    {
        let key = id_key(id);
        let updated = self.readings.transaction(|tx: &TransactionalTree| -> TxResult<Reading> {
            let Some(raw) = tx.get(key)? else {
                return abort(StoreError::ReadingNotFound(id));
            };
            let mut reading: Reading = match serde_json::from_slice(&raw) {
                Ok(r) => r,
                Err(e) => return abort(e),
            };
            if let Err(e) = modify(&mut reading) {
                return abort(e);
            }
            let bytes = match serde_json::to_vec(&reading) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };
            tx.insert(&key[..], bytes)?;
            Ok(reading)
        })?;
        Ok(updated)
    }

    /// Write all scoring fields at once. A reading is scored exactly once:
    /// an already scored reading is left untouched and yields
    /// [`StoreError::AlreadyScored`].
    pub fn apply_scoring(&self, id: u64, scoring: &ScoreResult) -> Result<Reading, StoreError> {
        self.modify_reading(id, |reading| {
            if reading.scoring.is_some() {
                return Err(StoreError::AlreadyScored(id));
            }
            reading.scoring = Some(scoring.clone());
            Ok(())
        })
    }

    /// Set the backup-triggered flag; returns `true` if it was not already set.
    pub fn mark_backup_triggered(&self, id: u64) -> Result<bool, StoreError> {
        let before = self.require_reading(id)?;
        if before.backup_triggered {
            return Ok(false);
        }
        self.modify_reading(id, |reading| {
            reading.backup_triggered = true;
            Ok(())
        })?;
        Ok(true)
    }

    /// All readings in id order.
    pub fn list_readings(&self) -> Result<Vec<Reading>, StoreError> {
        self.readings
            .iter()
            .values()
            .map(|raw| -> Result<Reading, StoreError> { Ok(serde_json::from_slice(&raw?)?) })
            .collect()
    }

    /// Most recent readings first, at most `limit`.
    pub fn recent_readings(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        self.readings
            .iter()
            .values()
            .rev()
            .take(limit)
            .map(|raw| -> Result<Reading, StoreError> { Ok(serde_json::from_slice(&raw?)?) })
            .collect()
    }

    pub fn reading_count(&self) -> usize {
        self.readings.len()
    }

    /// Remove the given readings in one batch.
    pub fn delete_readings(&self, ids: &[u64]) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for id in ids {
            batch.remove(id_key(*id).to_vec());
        }
        self.readings.apply_batch(batch)?;
        Ok(())
    }

    /// Replace every reading with `rows` and move the id sequence to the
    /// largest restored id, all in one transaction.
    pub fn replace_readings(&self, rows: &[Reading]) -> Result<(), StoreError> {
        let existing: Vec<sled::IVec> = self.readings.iter().keys().collect::<Result<_, _>>()?;
        let encoded: Vec<([u8; 8], Vec<u8>)> = rows
            .iter()
            .map(|r| -> Result<_, StoreError> { Ok((id_key(r.id), serde_json::to_vec(r)?)) })
            .collect::<Result<_, StoreError>>()?;
        let max_id = rows.iter().map(|r| r.id).max().unwrap_or(0);

        (&self.readings, &self.meta).transaction(|(readings, meta)| {
            for key in &existing {
                readings.remove(key.clone())?;
            }
            for (key, value) in &encoded {
                readings.insert(&key[..], value.as_slice())?;
            }
            meta.insert(READINGS_SEQ, max_id.to_be_bytes().to_vec())?;
            TxResult::Ok(())
        })?;
        Ok(())
    }

    // ========================================================================
    // Backup records
    // ========================================================================

    pub fn next_backup_id(&self) -> Result<u64, StoreError> {
        self.next_id(BACKUPS_SEQ)
    }

    pub fn get_backup(&self, artifact_name: &str) -> Result<Option<BackupRecord>, StoreError> {
        match self.backups.get(artifact_name)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Insert or update a record by artifact name.
    ///
    /// A stored success is never overwritten by a failure; in that case the
    /// stored record is returned unchanged.
    pub fn save_backup(&self, record: &BackupRecord) -> Result<BackupRecord, StoreError> {
        let key = record.artifact_name.as_bytes();
        let saved = self.backups.transaction(|tx: &TransactionalTree| -> TxResult<BackupRecord> {
            if let Some(raw) = tx.get(key)? {
                let stored: BackupRecord = match serde_json::from_slice(&raw) {
                    Ok(r) => r,
                    Err(e) => return abort(e),
                };
                if stored.is_success() && !record.is_success() {
                    return Ok(stored);
                }
            }
            let bytes = match serde_json::to_vec(record) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };
            tx.insert(key, bytes)?;
            Ok(record.clone())
        })?;
        Ok(saved)
    }

    /// Add a reading to a record's `triggered_by` set.
    pub fn associate_reading(
        &self,
        artifact_name: &str,
        reading_id: u64,
    ) -> Result<BackupRecord, StoreError> {
        let key = artifact_name.as_bytes();
        let updated = self.backups.transaction(|tx: &TransactionalTree| -> TxResult<BackupRecord> {
            let Some(raw) = tx.get(key)? else {
                return abort(StoreError::BackupNotFound(artifact_name.to_string()));
            };
            let mut record: BackupRecord = match serde_json::from_slice(&raw) {
                Ok(r) => r,
                Err(e) => return abort(e),
            };
            record.triggered_by.insert(reading_id);
            let bytes = match serde_json::to_vec(&record) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };
            tx.insert(key, bytes)?;
            Ok(record)
        })?;
        Ok(updated)
    }

    pub fn delete_backup(&self, artifact_name: &str) -> Result<Option<BackupRecord>, StoreError> {
        match self.backups.remove(artifact_name)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// All backup records, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>, StoreError> {
        let mut records: Vec<BackupRecord> = self
            .backups
            .iter()
            .values()
            .map(|raw| -> Result<BackupRecord, StoreError> { Ok(serde_json::from_slice(&raw?)?) })
            .collect::<Result<_, StoreError>>()?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        match self.meta.get(SETTINGS_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.meta.insert(SETTINGS_KEY, serde_json::to_vec(settings)?)?;
        self.meta.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackupStatus, Forecast, Measurements, TriggerReason};
    use std::collections::BTreeSet;

    fn new_reading() -> NewReading {
        NewReading {
            measurements: Measurements {
                ac_output_voltage: 230.0,
                dc_battery_voltage: 24.0,
                dc_battery_current: 10.0,
                load_power: 1000.0,
                temperature: 35.0,
            },
            is_manual: false,
            created_by: None,
        }
    }

    fn record(name: &str, status: BackupStatus) -> BackupRecord {
        let now = Utc::now();
        BackupRecord {
            id: 1,
            created_at: now,
            updated_at: now,
            artifact_name: name.to_string(),
            status,
            size_bytes: 0,
            trigger_reason: TriggerReason::Scheduled,
            error_message: None,
            created_by: None,
            triggered_by: BTreeSet::new(),
            attempts: 1,
            export_only: false,
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let store = Store::temporary().unwrap();
        let a = store.insert_reading(new_reading(), Utc::now()).unwrap();
        let b = store.insert_reading(new_reading(), Utc::now()).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(store.reading_count(), 2);
    }

    #[test]
    fn test_apply_scoring_and_mark() {
        let store = Store::temporary().unwrap();
        let r = store.insert_reading(new_reading(), Utc::now()).unwrap();
        let scoring = ScoreResult {
            is_anomaly: true,
            anomaly_score: -0.4,
            reasons: vec![],
            forecast: Forecast { dc_battery_current: 10.0, ac_output_voltage: 230.0 },
            is_abnormal_prediction: false,
        };
        let scored = store.apply_scoring(r.id, &scoring).unwrap();
        assert_eq!(scored.timestamp, r.timestamp);
        assert!(scored.is_anomaly());

        assert!(store.mark_backup_triggered(r.id).unwrap());
        assert!(!store.mark_backup_triggered(r.id).unwrap());
        assert!(store.require_reading(r.id).unwrap().backup_triggered);
        assert!(matches!(
            store.apply_scoring(99, &scoring),
            Err(StoreError::ReadingNotFound(99))
        ));
    }

    #[test]
    fn test_scoring_is_written_once() {
        let store = Store::temporary().unwrap();
        let r = store.insert_reading(new_reading(), Utc::now()).unwrap();
        let first = ScoreResult {
            is_anomaly: false,
            anomaly_score: 0.2,
            reasons: vec![],
            forecast: Forecast { dc_battery_current: 10.0, ac_output_voltage: 230.0 },
            is_abnormal_prediction: false,
        };
        let second = ScoreResult {
            is_anomaly: true,
            anomaly_score: -0.9,
            ..first.clone()
        };
        store.apply_scoring(r.id, &first).unwrap();
        assert!(matches!(
            store.apply_scoring(r.id, &second),
            Err(StoreError::AlreadyScored(id)) if id == r.id
        ));
        assert_eq!(store.require_reading(r.id).unwrap().scoring, Some(first));
    }

    #[test]
    fn test_recover_after_error_persists_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.insert_reading(new_reading(), Utc::now()).unwrap();
            store.recover_after_error().unwrap();
        }
        let reopened = Store::open(dir.path()).unwrap();
        assert_eq!(reopened.reading_count(), 1);
        assert_eq!(reopened.reading_sequence().unwrap(), 1);
    }

    #[test]
    fn test_success_record_not_downgraded() {
        let store = Store::temporary().unwrap();
        store.save_backup(&record("a.sql", BackupStatus::Success)).unwrap();
        let kept = store.save_backup(&record("a.sql", BackupStatus::Failed)).unwrap();
        assert!(kept.is_success());
        assert!(store.get_backup("a.sql").unwrap().unwrap().is_success());
    }

    #[test]
    fn test_replace_readings_resets_sequence() {
        let store = Store::temporary().unwrap();
        for _ in 0..5 {
            store.insert_reading(new_reading(), Utc::now()).unwrap();
        }
        let keep: Vec<Reading> = store.list_readings().unwrap().into_iter().take(3).collect();
        store.replace_readings(&keep).unwrap();
        assert_eq!(store.reading_count(), 3);
        assert_eq!(store.reading_sequence().unwrap(), 3);
        let next = store.insert_reading(new_reading(), Utc::now()).unwrap();
        assert_eq!(next.id, 4);
    }

    #[test]
    fn test_associate_reading() {
        let store = Store::temporary().unwrap();
        store.save_backup(&record("b.sql", BackupStatus::Success)).unwrap();
        let updated = store.associate_reading("b.sql", 7).unwrap();
        assert!(updated.triggered_by.contains(&7));
        assert!(matches!(
            store.associate_reading("missing.sql", 7),
            Err(StoreError::BackupNotFound(_))
        ));
    }
}
