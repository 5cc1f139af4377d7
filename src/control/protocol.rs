//! Wire format of the control channel.
//!
//! One connection carries one exchange: the client writes a single
//! [`ControlRequest`] as a JSON line, the server answers with a single
//! [`ControlResponse`] line and closes.

use serde::{Deserialize, Serialize};

use crate::backup::{BackupRequest, RestoreSummary};
use crate::ml_engine::{BatchScoreReport, ForceFlags, ScoreOutcome};
use crate::pipeline::MaintenanceReport;
use crate::simulation::SeededHistory;
use crate::types::{BackupRecord, BackupSummary, Reading, ReadingProfile, Settings};

/// Upper bound on one encoded request or response line.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// An operator command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ControlRequest {
    Simulate {
        profile: ReadingProfile,
        #[serde(default)]
        force: ForceFlags,
        #[serde(default)]
        actor: Option<String>,
    },
    Backup {
        request: BackupRequest,
    },
    Restore {
        artifact: String,
        #[serde(default)]
        actor: Option<String>,
    },
    DeleteBackup {
        artifact: String,
    },
    ListBackups {
        limit: usize,
    },
    Readings {
        limit: usize,
    },
    SettingsShow,
    SettingsSet {
        pairs: Vec<(String, String)>,
        #[serde(default)]
        actor: Option<String>,
    },
    Maintenance,
    SeedHistory {
        days: u32,
        #[serde(default)]
        interval_minutes: Option<i64>,
    },
    ScoreUnscored,
}

impl ControlRequest {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Simulate { .. } => "simulate",
            ControlRequest::Backup { .. } => "backup",
            ControlRequest::Restore { .. } => "restore",
            ControlRequest::DeleteBackup { .. } => "delete-backup",
            ControlRequest::ListBackups { .. } => "list-backups",
            ControlRequest::Readings { .. } => "readings",
            ControlRequest::SettingsShow => "settings-show",
            ControlRequest::SettingsSet { .. } => "settings-set",
            ControlRequest::Maintenance => "maintenance",
            ControlRequest::SeedHistory { .. } => "seed-history",
            ControlRequest::ScoreUnscored => "score-unscored",
        }
    }
}

/// What a successfully handled request produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlReply {
    Scored {
        outcome: ScoreOutcome,
    },
    BackedUp {
        performed: bool,
    },
    Restored {
        summary: RestoreSummary,
    },
    Deleted {
        artifact: String,
    },
    Backups {
        summary: BackupSummary,
        records: Vec<BackupRecord>,
    },
    Readings {
        total: usize,
        readings: Vec<Reading>,
    },
    Settings {
        settings: Settings,
    },
    /// `None` when another job held the runner and maintenance was skipped.
    Maintained {
        report: Option<MaintenanceReport>,
    },
    Seeded {
        history: SeededHistory,
    },
    ScoredBatch {
        report: BatchScoreReport,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ControlResponse {
    Ok { reply: ControlReply },
    Error { message: String },
}
