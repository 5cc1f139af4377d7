//! Backup records and trigger reasons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Justification recorded against a backup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerReason {
    #[serde(alias = "ANOMALY")]
    Anomaly,
    /// Formerly recorded as `prediction`.
    #[serde(alias = "prediction", alias = "PREDICTION")]
    AbnormalForecast,
    #[serde(alias = "MANUAL")]
    Manual,
    #[serde(alias = "SCHEDULED")]
    Scheduled,
    #[serde(alias = "UNKNOWN")]
    Unknown,
}

impl TriggerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerReason::Anomaly => "anomaly",
            TriggerReason::AbnormalForecast => "abnormal-forecast",
            TriggerReason::Manual => "manual",
            TriggerReason::Scheduled => "scheduled",
            TriggerReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TriggerReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "anomaly" => Ok(TriggerReason::Anomaly),
            "abnormal-forecast" | "prediction" => Ok(TriggerReason::AbnormalForecast),
            "manual" => Ok(TriggerReason::Manual),
            "scheduled" => Ok(TriggerReason::Scheduled),
            "unknown" => Ok(TriggerReason::Unknown),
            other => Err(format!("unknown trigger reason '{other}'")),
        }
    }
}

/// One step of the reason-resolution order used when a backup is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonRule {
    /// `force = true` resolves to [`TriggerReason::Manual`].
    Force,
    /// The caller's explicit reason is used as given.
    Explicit,
    /// The reading is flagged anomalous.
    Anomaly,
    /// The reading's forecast is out of bounds.
    #[serde(alias = "prediction")]
    AbnormalForecast,
}

impl ReasonRule {
    /// Default order: force > explicit > anomaly > abnormal-forecast.
    pub const DEFAULT_ORDER: [ReasonRule; 4] = [
        ReasonRule::Force,
        ReasonRule::Explicit,
        ReasonRule::Anomaly,
        ReasonRule::AbnormalForecast,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Success,
    Failed,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupStatus::Success => write!(f, "SUCCESS"),
            BackupStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One attempt to snapshot the dataset, keyed by its artifact name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Unique; a second attempt with the same name updates this record.
    pub artifact_name: String,
    pub status: BackupStatus,
    pub size_bytes: u64,
    pub trigger_reason: TriggerReason,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    /// Readings that triggered or were associated with this backup.
    #[serde(default)]
    pub triggered_by: BTreeSet<u64>,
    /// Number of dump attempts made under this name.
    #[serde(default)]
    pub attempts: u32,
    /// Written by a tool whose output cannot be restored into this store.
    #[serde(default)]
    pub export_only: bool,
}

impl BackupRecord {
    pub fn is_success(&self) -> bool {
        self.status == BackupStatus::Success
    }

    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }

    /// Mark a successful dump.
    pub fn record_success(&mut self, size_bytes: u64, at: DateTime<Utc>) {
        self.status = BackupStatus::Success;
        self.size_bytes = size_bytes;
        self.error_message = None;
        self.updated_at = at;
    }

    /// Mark a failed dump. A successful record never goes back to failed;
    /// returns `false` when the failure was ignored for that reason.
    pub fn record_failure(&mut self, message: String, at: DateTime<Utc>) -> bool {
        if self.is_success() {
            return false;
        }
        self.status = BackupStatus::Failed;
        self.size_bytes = 0;
        self.error_message = Some(message);
        self.updated_at = at;
        true
    }
}

/// Aggregate counts over all backup records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl BackupSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a BackupRecord>) -> Self {
        records.into_iter().fold(Self::default(), |mut acc, r| {
            acc.total += 1;
            if r.is_success() {
                acc.successful += 1;
            } else {
                acc.failed += 1;
            }
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: BackupStatus) -> BackupRecord {
        let now = Utc::now();
        BackupRecord {
            id: 1,
            created_at: now,
            updated_at: now,
            artifact_name: "energy_data_20250101_000000.sql".to_string(),
            status,
            size_bytes: 0,
            trigger_reason: TriggerReason::Manual,
            error_message: None,
            created_by: None,
            triggered_by: BTreeSet::new(),
            attempts: 1,
            export_only: false,
        }
    }

    #[test]
    fn test_success_is_sticky() {
        let mut r = record(BackupStatus::Success);
        r.size_bytes = 2048;
        assert!(!r.record_failure("pg_dump: error".to_string(), Utc::now()));
        assert!(r.is_success());
        assert_eq!(r.size_bytes, 2048);
        assert!(r.error_message.is_none());
    }

    #[test]
    fn test_failed_record_can_be_upgraded() {
        let mut r = record(BackupStatus::Failed);
        r.error_message = Some("connection refused".to_string());
        r.record_success(4096, Utc::now());
        assert!(r.is_success());
        assert!(r.error_message.is_none());
        assert!((r.size_kb() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_legacy_reason_codes_deserialize() {
        let reason: TriggerReason = serde_json::from_str("\"prediction\"").unwrap();
        assert_eq!(reason, TriggerReason::AbnormalForecast);
        let reason: TriggerReason = serde_json::from_str("\"SCHEDULED\"").unwrap();
        assert_eq!(reason, TriggerReason::Scheduled);
        assert_eq!(
            serde_json::to_string(&TriggerReason::AbnormalForecast).unwrap(),
            "\"abnormal-forecast\""
        );
    }

    #[test]
    fn test_summary_counts() {
        let records = vec![
            record(BackupStatus::Success),
            record(BackupStatus::Failed),
            record(BackupStatus::Success),
        ];
        let summary = BackupSummary::from_records(&records);
        assert_eq!(summary, BackupSummary { total: 3, successful: 2, failed: 1 });
    }
}
