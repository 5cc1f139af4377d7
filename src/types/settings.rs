//! Operator-tunable scheduling settings.
//!
//! A single record lives in the store. Raw fields keep whatever the operator
//! entered; scheduling code reads the accessor methods, which fall back to
//! the defaults in [`crate::config::defaults`] for non-positive or
//! inconsistent values, and clamp oversized values to the `MAX_*` limits so
//! that date arithmetic downstream can never overflow.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::ForecastBounds;
use crate::config::defaults;

/// The single global settings record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backup_frequency_hours: i64,
    pub backup_retention_days: i64,
    pub max_backups: i64,
    pub data_collection_interval_minutes: i64,
    /// Local time of day for the daily maintenance job.
    pub maintenance_time: NaiveTime,
    pub max_readings: i64,
    pub min_current_threshold: f64,
    pub max_current_threshold: f64,
    pub min_voltage_threshold: f64,
    pub max_voltage_threshold: f64,
    pub last_modified: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let (hour, minute) = defaults::MAINTENANCE_TIME;
        Self {
            backup_frequency_hours: defaults::BACKUP_FREQUENCY_HOURS,
            backup_retention_days: defaults::BACKUP_RETENTION_DAYS,
            max_backups: defaults::MAX_BACKUPS,
            data_collection_interval_minutes: defaults::DATA_COLLECTION_INTERVAL_MINUTES,
            maintenance_time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN),
            max_readings: defaults::MAX_READINGS,
            min_current_threshold: defaults::MIN_CURRENT_THRESHOLD,
            max_current_threshold: defaults::MAX_CURRENT_THRESHOLD,
            min_voltage_threshold: defaults::MIN_VOLTAGE_THRESHOLD,
            max_voltage_threshold: defaults::MAX_VOLTAGE_THRESHOLD,
            last_modified: None,
            modified_by: None,
        }
    }
}

fn bounded_or(value: i64, fallback: i64, max: i64) -> i64 {
    if value > 0 {
        value.min(max)
    } else {
        fallback
    }
}

impl Settings {
    pub fn backup_interval(&self) -> Duration {
        let hours = bounded_or(
            self.backup_frequency_hours,
            defaults::BACKUP_FREQUENCY_HOURS,
            defaults::MAX_BACKUP_FREQUENCY_HOURS,
        );
        Duration::try_hours(hours).unwrap_or_else(|| Duration::hours(defaults::BACKUP_FREQUENCY_HOURS))
    }

    pub fn collection_interval(&self) -> Duration {
        let minutes = bounded_or(
            self.data_collection_interval_minutes,
            defaults::DATA_COLLECTION_INTERVAL_MINUTES,
            defaults::MAX_DATA_COLLECTION_INTERVAL_MINUTES,
        );
        Duration::try_minutes(minutes)
            .unwrap_or_else(|| Duration::minutes(defaults::DATA_COLLECTION_INTERVAL_MINUTES))
    }

    pub fn retention_days(&self) -> u32 {
        let days = bounded_or(
            self.backup_retention_days,
            defaults::BACKUP_RETENTION_DAYS,
            defaults::MAX_BACKUP_RETENTION_DAYS,
        );
        u32::try_from(days).unwrap_or(u32::MAX)
    }

    pub fn max_backup_count(&self) -> usize {
        let count = bounded_or(self.max_backups, defaults::MAX_BACKUPS, defaults::MAX_BACKUPS_LIMIT);
        usize::try_from(count).unwrap_or(usize::MAX)
    }

    pub fn max_reading_count(&self) -> usize {
        let count = bounded_or(self.max_readings, defaults::MAX_READINGS, defaults::MAX_READINGS_LIMIT);
        usize::try_from(count).unwrap_or(usize::MAX)
    }

    /// Forecast bounds; an inverted or non-finite configured range falls back to defaults.
    pub fn forecast_bounds(&self) -> ForecastBounds {
        let configured = ForecastBounds {
            min_current: self.min_current_threshold,
            max_current: self.max_current_threshold,
            min_voltage: self.min_voltage_threshold,
            max_voltage: self.max_voltage_threshold,
        };
        if configured.is_valid() {
            configured
        } else {
            ForecastBounds {
                min_current: defaults::MIN_CURRENT_THRESHOLD,
                max_current: defaults::MAX_CURRENT_THRESHOLD,
                min_voltage: defaults::MIN_VOLTAGE_THRESHOLD,
                max_voltage: defaults::MAX_VOLTAGE_THRESHOLD,
            }
        }
    }

    /// Set one field from its textual form (used by `settings set`).
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let int = |max: i64| {
            let parsed = value
                .trim()
                .parse::<i64>()
                .map_err(|_| SettingsError::InvalidValue(key.to_string(), value.to_string()))?;
            if parsed > max {
                return Err(SettingsError::OutOfRange {
                    key: key.to_string(),
                    value: parsed,
                    max,
                });
            }
            Ok(parsed)
        };
        let float = || {
            value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| SettingsError::InvalidValue(key.to_string(), value.to_string()))
        };

        match key {
            "backup_frequency_hours" => {
                self.backup_frequency_hours = int(defaults::MAX_BACKUP_FREQUENCY_HOURS)?;
            }
            "backup_retention_days" => {
                self.backup_retention_days = int(defaults::MAX_BACKUP_RETENTION_DAYS)?;
            }
            "max_backups" => self.max_backups = int(defaults::MAX_BACKUPS_LIMIT)?,
            "data_collection_interval_minutes" | "data_collection_interval" => {
                self.data_collection_interval_minutes =
                    int(defaults::MAX_DATA_COLLECTION_INTERVAL_MINUTES)?;
            }
            "max_readings" | "max_energy_logs" => self.max_readings = int(defaults::MAX_READINGS_LIMIT)?,
            "min_current_threshold" => self.min_current_threshold = float()?,
            "max_current_threshold" => self.max_current_threshold = float()?,
            "min_voltage_threshold" => self.min_voltage_threshold = float()?,
            "max_voltage_threshold" => self.max_voltage_threshold = float()?,
            "maintenance_time" => {
                self.maintenance_time = NaiveTime::parse_from_str(value.trim(), "%H:%M")
                    .or_else(|_| NaiveTime::parse_from_str(value.trim(), "%H:%M:%S"))
                    .map_err(|_| SettingsError::InvalidValue(key.to_string(), value.to_string()))?;
            }
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown settings key '{0}'")]
    UnknownKey(String),
    #[error("invalid value for {0}: '{1}'")]
    InvalidValue(String, String),
    #[error("{key} = {value} exceeds the maximum of {max}")]
    OutOfRange { key: String, value: i64, max: i64 },
}
