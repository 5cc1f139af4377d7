//! System-wide default constants.
//!
//! Centralises the fallback values used when settings are missing or
//! non-positive. Grouped by subsystem for easy discovery.

// ============================================================================
// Operator settings
// ============================================================================

/// Scheduled backup cadence (hours).
pub const BACKUP_FREQUENCY_HOURS: i64 = 24;

/// Age after which backup artifacts are evicted (days).
pub const BACKUP_RETENTION_DAYS: i64 = 30;

/// Maximum number of backup artifacts kept on disk.
pub const MAX_BACKUPS: i64 = 20;

/// Interval between simulated/collected readings (minutes).
pub const DATA_COLLECTION_INTERVAL_MINUTES: i64 = 15;

/// Maximum number of readings kept in the store.
pub const MAX_READINGS: i64 = 5_000;

/// Daily maintenance time of day, local time (hour, minute).
pub const MAINTENANCE_TIME: (u32, u32) = (0, 0);

/// Largest accepted backup cadence (hours). One year.
pub const MAX_BACKUP_FREQUENCY_HOURS: i64 = 24 * 366;

/// Largest accepted backup retention (days). Ten years.
pub const MAX_BACKUP_RETENTION_DAYS: i64 = 3_660;

/// Largest accepted collection interval (minutes). Thirty days.
pub const MAX_DATA_COLLECTION_INTERVAL_MINUTES: i64 = 30 * 24 * 60;

/// Largest accepted artifact count.
pub const MAX_BACKUPS_LIMIT: i64 = 100_000;

/// Largest accepted reading count.
pub const MAX_READINGS_LIMIT: i64 = 100_000_000;

// ============================================================================
// Forecast bounds
// ============================================================================

/// Lower bound for the predicted battery current (A).
pub const MIN_CURRENT_THRESHOLD: f64 = 3.0;

/// Upper bound for the predicted battery current (A).
pub const MAX_CURRENT_THRESHOLD: f64 = 16.0;

/// Lower bound for the predicted AC output voltage (V).
pub const MIN_VOLTAGE_THRESHOLD: f64 = 222.0;

/// Upper bound for the predicted AC output voltage (V).
pub const MAX_VOLTAGE_THRESHOLD: f64 = 238.0;

// ============================================================================
// Backup
// ============================================================================

/// Prefix of artifact file names: `<prefix>_%Y%m%d_%H%M%S.sql`.
pub const ARTIFACT_PREFIX: &str = "energy_data";

/// Table name written to / extracted from SQL-text artifacts.
pub const READINGS_TABLE: &str = "energy_readings";

/// Maximum stored length of a dump error message (characters).
pub const MAX_ERROR_MESSAGE_LEN: usize = 255;

/// Upper bound on an external dump command (seconds).
pub const DUMP_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// Scheduler
// ============================================================================

/// Polling tick of the scheduler loop (milliseconds).
pub const SCHEDULER_TICK_MILLIS: u64 = 1_000;

/// How often the scheduler re-reads settings and re-plans (seconds).
pub const SETTINGS_RELOAD_SECS: u64 = 300;

/// Graceful wait before a stop escalates to a forced kill (seconds).
pub const STOP_TIMEOUT_SECS: u64 = 5;

/// Poll interval while waiting for a stopping scheduler (milliseconds).
pub const STOP_POLL_MILLIS: u64 = 100;

/// Settling delay between stop and start on restart (seconds).
pub const RESTART_SETTLE_SECS: u64 = 1;

/// Delay before checking that a detached scheduler came up (seconds).
pub const START_CHECK_DELAY_SECS: u64 = 2;

/// Log file of a detached scheduler when `[logging].file` is unset,
/// relative to the pid directory.
pub const DETACHED_LOG_FILE: &str = "gridwarden-scheduler.log";

/// Operator control socket of a running scheduler, relative to the pid directory.
pub const CONTROL_SOCKET_FILE: &str = "gridwarden.sock";

/// Upper bound on one operator request to a running scheduler (seconds).
/// Covers a dump or restore running under it.
pub const CONTROL_TIMEOUT_SECS: u64 = 600;

/// Upper bound on connecting to the control socket (milliseconds).
pub const CONTROL_CONNECT_MILLIS: u64 = 2_000;

// ============================================================================
// Simulation
// ============================================================================

/// Chance that a normal-profile request injects a mild single-feature excursion.
pub const ORGANIC_ANOMALY_PROBABILITY: f64 = 0.15;

/// Candidates tried when steering a reading toward an abnormal forecast.
pub const ABNORMAL_FORECAST_ATTEMPTS: usize = 64;

/// Days of history seeded by `seed-history` when none are given.
pub const HISTORY_DAYS: u32 = 30;

/// Longest history `seed-history` accepts (days).
pub const MAX_HISTORY_DAYS: u32 = 366;

// ============================================================================
// Logging
// ============================================================================

/// Rotate the log file once it exceeds this size (bytes). 10 MiB.
pub const LOG_ROTATE_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Rotate the log file once it is older than this (days).
pub const LOG_ROTATE_MAX_AGE_DAYS: u64 = 7;

/// Number of rotated log files to keep.
pub const LOG_ROTATE_KEEP: usize = 5;

/// Log lines shown by `status`.
pub const STATUS_LOG_TAIL_LINES: usize = 5;
