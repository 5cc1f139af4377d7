//! Deployment configuration loaded from TOML.
//!
//! Every section is optional; missing sections and keys take the defaults in
//! [`super::defaults`], so an absent config file behaves like the stock
//! deployment.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;
use crate::types::ReasonRule;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "GRIDWARDEN_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "gridwarden.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one gridwarden deployment.
///
/// Load with `AppConfig::load()` which searches:
/// 1. `$GRIDWARDEN_CONFIG`
/// 2. `./gridwarden.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration using the standard search order.
    ///
    /// A file that exists but fails to parse or validate is skipped with a
    /// warning, matching the behaviour for an unset search path.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config = Self::from_toml_str(&contents)
            .map_err(|e| match e {
                ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
                other => other,
            })?;
        Ok(config)
    }

    /// Parse and validate a TOML document. Unknown keys only warn.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// The scheduler's log file: `[logging].file`, or the file a detached
    /// scheduler's output is appended to. Both are rotated by maintenance.
    pub fn scheduler_log_path(&self) -> PathBuf {
        self.logging
            .file
            .clone()
            .unwrap_or_else(|| self.scheduler.pid_dir.join(defaults::DETACHED_LOG_FILE))
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check every section; all problems are reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let b = &self.backup;
        if b.artifact_prefix.trim().is_empty() {
            errors.push("backup.artifact_prefix must not be empty".to_string());
        }
        if b.artifact_prefix.contains(['/', '\\']) {
            errors.push("backup.artifact_prefix must not contain path separators".to_string());
        }
        if !is_sql_identifier(&b.table) {
            errors.push(format!(
                "backup.table = '{}' is not a plain SQL identifier",
                b.table
            ));
        }
        if b.max_error_len == 0 {
            errors.push("backup.max_error_len must be > 0".to_string());
        }
        if b.reason_order.is_empty() {
            errors.push("backup.reason_order must list at least one rule".to_string());
        }
        let unique: HashSet<_> = b.reason_order.iter().collect();
        if unique.len() != b.reason_order.len() {
            errors.push("backup.reason_order contains duplicate rules".to_string());
        }
        if b.mode == DumpMode::Command {
            if b.command.program.trim().is_empty() {
                errors.push("backup.command.program must not be empty".to_string());
            }
            if b.command.database.trim().is_empty() {
                errors.push("backup.command.database must not be empty".to_string());
            }
            if b.command.timeout_secs == 0 {
                errors.push("backup.command.timeout_secs must be > 0".to_string());
            }
        }

        let s = &self.scheduler;
        if s.tick_millis == 0 {
            errors.push("scheduler.tick_millis must be > 0".to_string());
        }
        if s.settings_reload_secs == 0 {
            errors.push("scheduler.settings_reload_secs must be > 0".to_string());
        }
        if s.control_timeout_secs == 0 {
            errors.push("scheduler.control_timeout_secs must be > 0".to_string());
        }

        let p = self.simulation.organic_anomaly_probability;
        if !(0.0..=1.0).contains(&p) {
            errors.push(format!(
                "simulation.organic_anomaly_probability = {p} must be within [0, 1]"
            ));
        }

        if self.logging.rotate_keep == 0 {
            errors.push("logging.rotate_keep must be > 0".to_string());
        }
        if let Some(level) = self.logging.level.as_deref() {
            if tracing_subscriber::EnvFilter::try_new(level).is_err() {
                errors.push(format!("logging.level = '{level}' is not a valid filter"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the sled database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

// ============================================================================
// Backup
// ============================================================================

/// How artifacts are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpMode {
    /// Write the SQL-text artifact directly from the local store.
    #[default]
    Native,
    /// Run an external dump program (`pg_dump` compatible) against a
    /// PostgreSQL deployment. The artifacts are exports of that database,
    /// not of the local store, and `restore` refuses them.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding one artifact file per backup
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_artifact_prefix")]
    pub artifact_prefix: String,

    /// Table written to and extracted from artifacts
    #[serde(default = "default_table")]
    pub table: String,

    /// Stored dump error messages are truncated to this many characters
    #[serde(default = "default_max_error_len")]
    pub max_error_len: usize,

    #[serde(default)]
    pub mode: DumpMode,

    /// First matching rule decides the trigger reason
    #[serde(default = "default_reason_order")]
    pub reason_order: Vec<ReasonRule>,

    #[serde(default)]
    pub command: CommandDumpConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            artifact_prefix: default_artifact_prefix(),
            table: default_table(),
            max_error_len: default_max_error_len(),
            mode: DumpMode::default(),
            reason_order: default_reason_order(),
            command: CommandDumpConfig::default(),
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}
fn default_artifact_prefix() -> String {
    defaults::ARTIFACT_PREFIX.to_string()
}
fn default_table() -> String {
    defaults::READINGS_TABLE.to_string()
}
fn default_max_error_len() -> usize {
    defaults::MAX_ERROR_MESSAGE_LEN
}
fn default_reason_order() -> Vec<ReasonRule> {
    ReasonRule::DEFAULT_ORDER.to_vec()
}

/// Connection parameters for the external dump program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDumpConfig {
    #[serde(default = "default_dump_program")]
    pub program: String,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_name")]
    pub database: String,
    /// Name of the environment variable holding the password (passed on as `PGPASSWORD`)
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_dump_timeout")]
    pub timeout_secs: u64,
}

impl Default for CommandDumpConfig {
    fn default() -> Self {
        Self {
            program: default_dump_program(),
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            database: default_db_name(),
            password_env: default_password_env(),
            timeout_secs: default_dump_timeout(),
        }
    }
}

fn default_dump_program() -> String {
    "pg_dump".to_string()
}
fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_db_user() -> String {
    "postgres".to_string()
}
fn default_db_name() -> String {
    "energy_monitor".to_string()
}
fn default_password_env() -> String {
    "GRIDWARDEN_DB_PASSWORD".to_string()
}
fn default_dump_timeout() -> u64 {
    defaults::DUMP_TIMEOUT_SECS
}

// ============================================================================
// Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_models_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_anomaly_file")]
    pub anomaly_file: String,
    #[serde(default = "default_forecast_file")]
    pub forecast_file: String,
}

impl ModelsConfig {
    pub fn anomaly_path(&self) -> PathBuf {
        self.dir.join(&self.anomaly_file)
    }

    pub fn forecast_path(&self) -> PathBuf {
        self.dir.join(&self.forecast_file)
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
            anomaly_file: default_anomaly_file(),
            forecast_file: default_forecast_file(),
        }
    }
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}
fn default_anomaly_file() -> String {
    "anomaly_model.json".to_string()
}
fn default_forecast_file() -> String {
    "forecast_model.json".to_string()
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    #[serde(default = "default_settings_reload_secs")]
    pub settings_reload_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_restart_settle_secs")]
    pub restart_settle_secs: u64,
    /// Run the maintenance job once when the loop starts
    #[serde(default = "default_true")]
    pub run_maintenance_on_start: bool,
    /// Directory for the scheduler pid file and control socket
    #[serde(default = "default_pid_dir")]
    pub pid_dir: PathBuf,
    /// Upper bound on one operator request served by a running scheduler
    #[serde(default = "default_control_timeout_secs")]
    pub control_timeout_secs: u64,
}

impl SchedulerConfig {
    /// Unix socket on which a running scheduler accepts operator requests.
    pub fn control_socket_path(&self) -> PathBuf {
        self.pid_dir.join(defaults::CONTROL_SOCKET_FILE)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
            settings_reload_secs: default_settings_reload_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            restart_settle_secs: default_restart_settle_secs(),
            run_maintenance_on_start: true,
            pid_dir: default_pid_dir(),
            control_timeout_secs: default_control_timeout_secs(),
        }
    }
}

fn default_tick_millis() -> u64 {
    defaults::SCHEDULER_TICK_MILLIS
}
fn default_settings_reload_secs() -> u64 {
    defaults::SETTINGS_RELOAD_SECS
}
fn default_stop_timeout_secs() -> u64 {
    defaults::STOP_TIMEOUT_SECS
}
fn default_restart_settle_secs() -> u64 {
    defaults::RESTART_SETTLE_SECS
}
fn default_control_timeout_secs() -> u64 {
    defaults::CONTROL_TIMEOUT_SECS
}
fn default_true() -> bool {
    true
}
fn default_pid_dir() -> PathBuf {
    PathBuf::from("data")
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_organic_probability")]
    pub organic_anomaly_probability: f64,
    /// Fixed RNG seed; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            organic_anomaly_probability: default_organic_probability(),
            seed: None,
        }
    }
}

fn default_organic_probability() -> f64 {
    defaults::ORGANIC_ANOMALY_PROBABILITY
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: bool,
    /// Scheduler log file; rotated by the maintenance job
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_rotate_max_bytes")]
    pub rotate_max_bytes: u64,
    #[serde(default = "default_rotate_max_age_days")]
    pub rotate_max_age_days: u64,
    #[serde(default = "default_rotate_keep")]
    pub rotate_keep: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
            file: None,
            rotate_max_bytes: default_rotate_max_bytes(),
            rotate_max_age_days: default_rotate_max_age_days(),
            rotate_keep: default_rotate_keep(),
        }
    }
}

fn default_rotate_max_bytes() -> u64 {
    defaults::LOG_ROTATE_MAX_BYTES
}
fn default_rotate_max_age_days() -> u64 {
    defaults::LOG_ROTATE_MAX_AGE_DAYS
}
fn default_rotate_keep() -> usize {
    defaults::LOG_ROTATE_KEEP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.backup.artifact_prefix, "energy_data");
        assert_eq!(config.backup.table, "energy_readings");
        assert_eq!(config.backup.max_error_len, 255);
        assert_eq!(config.backup.reason_order, ReasonRule::DEFAULT_ORDER.to_vec());
        assert_eq!(config.scheduler.settings_reload_secs, 300);
        assert!(config.scheduler.run_maintenance_on_start);
        assert_eq!(config.storage.db_path(), PathBuf::from("data/db"));
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::from_toml_str(
            r#"
[backup]
dir = "/var/backups/energy"
reason_order = ["explicit", "prediction", "anomaly"]

[backup.command]
port = 6543
"#,
        )
        .unwrap();
        assert_eq!(config.backup.dir, PathBuf::from("/var/backups/energy"));
        assert_eq!(
            config.backup.reason_order,
            vec![ReasonRule::Explicit, ReasonRule::AbnormalForecast, ReasonRule::Anomaly]
        );
        assert_eq!(config.backup.command.port, 6543);
        assert_eq!(config.backup.command.program, "pg_dump");
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = AppConfig::default();
        config.backup.table = "readings; DROP".to_string();
        config.scheduler.tick_millis = 0;
        config.simulation.organic_anomaly_probability = 1.5;
        config.backup.reason_order = vec![ReasonRule::Anomaly, ReasonRule::Anomaly];

        match config.validate() {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = AppConfig::default().to_toml().unwrap();
        let parsed = AppConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.backup.artifact_prefix, defaults::ARTIFACT_PREFIX);
    }

    #[test]
    fn test_load_from_missing_file_is_io_error() {
        let err = AppConfig::load_from_file(Path::new("/nonexistent/gridwarden.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }
}
