//! gridwarden: energy-system monitoring with anomaly-triggered backups
//!
//! ## Architecture
//!
//! - **Simulation**: synthetic inverter readings (normal, anomaly, abnormal-forecast)
//! - **ML Engine**: anomaly scoring and next-step forecasting against bounds
//! - **Backup**: deduplicated, idempotent SQL-text snapshots, restore and cleanup
//! - **Maintenance**: reading/backup retention and log rotation
//! - **Scheduler**: collection, scheduled-backup and maintenance jobs with
//!   settings hot-reload
//! - **Control**: operator commands served by the running scheduler over a
//!   Unix socket

pub mod backup;
pub mod clock;
pub mod config;
pub mod control;
pub mod maintenance;
pub mod ml_engine;
pub mod pipeline;
pub mod scheduler;
pub mod simulation;
pub mod storage;
pub mod types;

pub use config::AppConfig;
pub use pipeline::{JobError, JobOutcome, Services};

pub use types::{
    AnomalyReason, BackupRecord, BackupStatus, Measurements, Reading, ReadingProfile, Settings,
    TriggerReason,
};

pub use backup::{BackupCoordinator, BackupError, BackupRequest};
pub use ml_engine::{ForceFlags, ScoringEngine};
pub use scheduler::{SchedulerHandle, TaskScheduler};
pub use storage::{SettingsStore, Store, StoreError};
