//! Shared harness for the integration tests: a temporary store, a manual
//! clock, in-code models and a scripted dump tool.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use gridwarden::backup::{DumpError, DumpTool};
use gridwarden::storage::StoreError;
use gridwarden::clock::{Clock, ManualClock};
use gridwarden::config::AppConfig;
use gridwarden::ml_engine::{GaussianAnomalyModel, LinearForecastModel, ModelLoader};
use gridwarden::pipeline::Services;
use gridwarden::storage::Store;
use gridwarden::types::{Measurements, NewReading, Reading};

/// Dump tool that fails a set number of times, then writes a small file.
#[derive(Debug, Default)]
pub struct ScriptedDump {
    failures_left: AtomicUsize,
    storage_failures_left: AtomicUsize,
    stall: Option<std::time::Duration>,
    export_only: bool,
    calls: AtomicUsize,
}

impl ScriptedDump {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    /// Fails with an I/O-class store error `times` times.
    pub fn storage_failing(times: usize) -> Self {
        Self {
            storage_failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    /// Sleeps for `stall` before writing.
    pub fn stalling(stall: std::time::Duration) -> Self {
        Self {
            stall: Some(stall),
            ..Self::default()
        }
    }

    /// Artifacts that cannot be restored into the store.
    pub fn export_only() -> Self {
        Self {
            export_only: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DumpTool for ScriptedDump {
    async fn dump(&self, output: &Path) -> Result<(), DumpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        let storage_failing = self
            .storage_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if storage_failing {
            return Err(DumpError::Store(StoreError::Sled(sled::Error::Io(
                std::io::Error::new(std::io::ErrorKind::Other, "disk unavailable"),
            ))));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            tokio::fs::write(output, "-- partial").await?;
            return Err(DumpError::Exit {
                code: Some(1),
                stderr: "could not connect to server: Connection refused".to_string(),
            });
        }
        tokio::fs::write(output, "-- scripted dump\n").await?;
        Ok(())
    }

    fn tool_name(&self) -> &str {
        "scripted"
    }

    fn restorable(&self) -> bool {
        !self.export_only
    }
}

pub struct Harness {
    pub services: Arc<Services>,
    pub clock: Arc<ManualClock>,
    pub dump: Arc<ScriptedDump>,
    pub dir: TempDir,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.data_dir = dir.join("data");
    config.backup.dir = dir.join("backups");
    config.scheduler.pid_dir = dir.join("run");
    config.scheduler.tick_millis = 10;
    config.scheduler.stop_timeout_secs = 2;
    config.scheduler.restart_settle_secs = 0;
    config.simulation.organic_anomaly_probability = 0.0;
    config.simulation.seed = Some(7);
    config
}

fn build(dump: Option<Arc<ScriptedDump>>, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);

    let clock = Arc::new(ManualClock::new(start_time()));
    let models = ModelLoader::preloaded(
        Arc::new(GaussianAnomalyModel::default()),
        Arc::new(LinearForecastModel::default()),
    );
    let scripted = dump.clone().unwrap_or_default();
    let services = Services::assemble(
        config,
        Store::temporary().unwrap(),
        Arc::clone(&clock) as Arc<dyn Clock>,
        models,
        dump.map(|d| d as Arc<dyn DumpTool>),
    )
    .unwrap();

    Harness {
        services: Arc::new(services),
        clock,
        dump: scripted,
        dir,
    }
}

/// Harness whose backups go through a [`ScriptedDump`].
pub fn scripted_harness(dump: ScriptedDump) -> Harness {
    build(Some(Arc::new(dump)), |_| {})
}

pub fn scripted_harness_with(dump: ScriptedDump, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    build(Some(Arc::new(dump)), tweak)
}

/// Harness using the native SQL-text dump of the store.
pub fn native_harness() -> Harness {
    build(None, |_| {})
}

/// Mean operating point of the bundled models; never anomalous.
pub fn nominal() -> Measurements {
    Measurements {
        ac_output_voltage: 230.0,
        dc_battery_voltage: 24.0,
        dc_battery_current: 10.0,
        load_power: 1000.0,
        temperature: 35.0,
    }
}

pub fn insert(h: &Harness, measurements: Measurements) -> Reading {
    h.services
        .store
        .insert_reading(
            NewReading {
                measurements,
                is_manual: false,
                created_by: None,
            },
            h.clock.now(),
        )
        .unwrap()
}
