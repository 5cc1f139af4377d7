//! Dump tools: produce one SQL artifact at a given path.
//!
//! [`NativeDumpTool`] writes the store's readings directly.
//! [`CommandDumpTool`] shells out to an external `pg_dump`-compatible
//! program for deployments where the readings live in PostgreSQL. Its
//! artifacts are export-only: they are recorded and retained like any
//! other, but never restored into the local store.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use super::artifact::render_sql_dump;
use crate::clock::Clock;
use crate::config::CommandDumpConfig;
use crate::storage::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("dump exited with {}: {stderr}", code.map_or("signal".to_string(), |c| format!("status {c}")))]
    Exit { code: Option<i32>, stderr: String },
    #[error("failed to start dump program '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dump timed out after {0}s")]
    Timeout(u64),
    #[error("cannot create backup directory {}: {source}", path.display())]
    BackupDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact missing after dump: {0}")]
    Missing(#[source] std::io::Error),
    #[error("failed to write artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Something that can write a full SQL dump of the readings to a file.
#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Write the artifact at `output`. On error the file may be partial.
    async fn dump(&self, output: &Path) -> Result<(), DumpError>;

    /// Short name for logs.
    fn tool_name(&self) -> &str;

    /// Whether the artifacts can be restored into the local store.
    fn restorable(&self) -> bool {
        true
    }
}

// ============================================================================
// Native dump (sled store)
// ============================================================================

pub struct NativeDumpTool {
    store: Store,
    table: String,
    clock: Arc<dyn Clock>,
}

impl NativeDumpTool {
    pub fn new(store: Store, table: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            table: table.into(),
            clock,
        }
    }
}

#[async_trait]
impl DumpTool for NativeDumpTool {
    async fn dump(&self, output: &Path) -> Result<(), DumpError> {
        let readings = self.store.list_readings()?;
        let sql = render_sql_dump(&self.table, &readings, self.clock.now());
        tokio::fs::write(output, sql).await?;
        tracing::debug!(rows = readings.len(), path = %output.display(), "Native dump written");
        Ok(())
    }

    fn tool_name(&self) -> &str {
        "native"
    }
}

// ============================================================================
// External command (pg_dump)
// ============================================================================

pub struct CommandDumpTool {
    config: CommandDumpConfig,
}

impl CommandDumpTool {
    pub fn new(config: CommandDumpConfig) -> Self {
        Self { config }
    }

    fn command(&self, output: &Path) -> tokio::process::Command {
        let cfg = &self.config;
        let mut cmd = tokio::process::Command::new(&cfg.program);
        cmd.arg("-h")
            .arg(&cfg.host)
            .arg("-p")
            .arg(cfg.port.to_string())
            .arg("-U")
            .arg(&cfg.user)
            .arg("-d")
            .arg(&cfg.database)
            .arg("-f")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match std::env::var(&cfg.password_env) {
            Ok(password) => {
                cmd.env("PGPASSWORD", password);
            }
            Err(_) => {
                tracing::debug!(var = %cfg.password_env, "No database password in environment");
            }
        }
        cmd
    }
}

#[async_trait]
impl DumpTool for CommandDumpTool {
    async fn dump(&self, output: &Path) -> Result<(), DumpError> {
        let child = self.command(output).spawn().map_err(|source| DumpError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| DumpError::Timeout(self.config.timeout_secs))??;

        if result.status.success() {
            Ok(())
        } else {
            Err(DumpError::Exit {
                code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            })
        }
    }

    fn tool_name(&self) -> &str {
        &self.config.program
    }

    /// The dump is of the external PostgreSQL database, not of this store.
    fn restorable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::{Measurements, NewReading};
    use chrono::Utc;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_native_dump_writes_copy_block() {
        let store = Store::temporary().unwrap();
        store
            .insert_reading(
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
                },
                Utc::now(),
            )
            .unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("out.sql");
        let tool = NativeDumpTool::new(store, "energy_readings", Arc::new(SystemClock));
        assert_ok!(tool.dump(&path).await);

        let sql = std::fs::read_to_string(&path).unwrap();
        assert!(sql.contains("COPY public.energy_readings ("));
        assert!(sql.contains("\n\\.\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_failure_captures_stderr() {
        let dir = tempdir().unwrap();
        let tool = CommandDumpTool::new(CommandDumpConfig {
            program: "false".to_string(),
            ..CommandDumpConfig::default()
        });
        let err = assert_err!(tool.dump(&dir.path().join("out.sql")).await);
        assert!(matches!(err, DumpError::Exit { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempdir().unwrap();
        let tool = CommandDumpTool::new(CommandDumpConfig {
            program: "gridwarden-no-such-dump-program".to_string(),
            ..CommandDumpConfig::default()
        });
        let err = tool.dump(&dir.path().join("out.sql")).await.unwrap_err();
        assert!(matches!(err, DumpError::Spawn { .. }));
    }
}
