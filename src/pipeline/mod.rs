//! Service wiring and the job bodies run by the scheduler.
//!
//! ```text
//! collect:      ReadingGenerator ─▶ ScoringEngine ─▶ BackupCoordinator::check_and_backup_if_needed
//! backup:       BackupCoordinator::backup(reason = scheduled)
//! maintenance:  RetentionManager (readings + backups) ─▶ LogRotator
//! ```
//!
//! Every job goes through the shared `JobRunner`, so two mutating jobs never
//! overlap within a process. The operator tasks that rewrite many readings
//! (restore, history seeding, batch scoring) claim the same runner and are
//! refused while a job holds it.

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backup::{
    dump_tool_for, BackupCoordinator, BackupError, BackupRequest, DumpTool, RestoreSummary,
};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::maintenance::{LogRotator, RetentionManager, RetentionReport};
use crate::ml_engine::{
    BatchScoreReport, ForceFlags, ModelLoader, ScoreOutcome, ScoringEngine, ScoringError,
};
use crate::scheduler::{JobGuard, JobKind, JobRunner, RunnerTask};
use crate::simulation::{GeneratorError, ReadingGenerator, SeededHistory};
use crate::storage::{SettingsStore, Store, StoreError};
use crate::types::{ReadingProfile, Settings, SettingsError};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("reading generation failed: {0}")]
    Generate(#[from] GeneratorError),
    #[error("scoring failed: {0}")]
    Scoring(#[from] ScoringError),
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("log rotation failed: {0}")]
    LogRotation(#[source] std::io::Error),
    #[error("cannot run {requested}: {running} is in progress")]
    Busy {
        requested: RunnerTask,
        running: RunnerTask,
    },
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl JobError {
    /// Storage I/O failures; the store is flushed and the loop moves on.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Generate(GeneratorError::Store(e)) | JobError::Store(e) => e.is_transient(),
            JobError::Scoring(e) => e.is_transient(),
            JobError::Backup(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Missing or unreadable model files; retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JobError::Generate(GeneratorError::ModelConfig(_))
                | JobError::Scoring(ScoringError::ModelConfig(_))
        )
    }
}

/// What a job invocation did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Collected(ScoreOutcome),
    BackedUp(bool),
    Maintained(MaintenanceReport),
    /// Another job was running; this one waits for its next firing.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub retention: RetentionReport,
    pub log_rotated: bool,
}

/// All long-lived services of one gridwarden process.
pub struct Services {
    pub config: AppConfig,
    pub store: Store,
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<SettingsStore>,
    pub models: Arc<ModelLoader>,
    pub backup: Arc<BackupCoordinator>,
    pub scoring: ScoringEngine,
    pub generator: ReadingGenerator,
    pub retention: RetentionManager,
    pub log_rotator: LogRotator,
    pub runner: JobRunner,
}

impl Services {
    /// Open the store under `[storage].data_dir` and wire everything.
    pub fn open(config: AppConfig) -> Result<Self> {
        let db_path = config.storage.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }
        let store = Store::open(&db_path).with_context(|| {
            format!(
                "Failed to open database at {} (is the scheduler running? stop it first)",
                db_path.display()
            )
        })?;
        let models = ModelLoader::from_config(&config.models);
        Self::assemble(config, store, Arc::new(SystemClock), models, None)
            .context("Failed to initialise services")
    }

    /// Wire services around an existing store. `dump` overrides the tool
    /// selected by `[backup].mode`.
    pub fn assemble(
        config: AppConfig,
        store: Store,
        clock: Arc<dyn Clock>,
        models: ModelLoader,
        dump: Option<Arc<dyn DumpTool>>,
    ) -> Result<Self, StoreError> {
        let settings = Arc::new(SettingsStore::open(store.clone())?);
        let models = Arc::new(models);
        let dump = dump.unwrap_or_else(|| dump_tool_for(&config.backup, store.clone(), Arc::clone(&clock)));

        let backup = Arc::new(BackupCoordinator::new(
            &config.backup,
            store.clone(),
            Arc::clone(&settings),
            dump,
            Arc::clone(&clock),
        ));
        let scoring = ScoringEngine::new(
            store.clone(),
            Arc::clone(&settings),
            Arc::clone(&models),
            Arc::clone(&backup),
            config.simulation.seed,
        );
        let generator = ReadingGenerator::new(
            &config.simulation,
            store.clone(),
            Arc::clone(&settings),
            Arc::clone(&models),
            Arc::clone(&clock),
        );
        let retention = RetentionManager::new(store.clone(), Arc::clone(&settings), Arc::clone(&backup));
        let log_rotator = LogRotator::from_config(&config);

        Ok(Self {
            config,
            store,
            clock,
            settings,
            models,
            backup,
            scoring,
            generator,
            retention,
            log_rotator,
            runner: JobRunner::new(),
        })
    }

    /// Generate a reading for `profile` and run it through scoring, which
    /// in turn runs the backup check.
    pub async fn simulate(
        &self,
        profile: ReadingProfile,
        force: ForceFlags,
        is_manual: bool,
        actor: Option<&str>,
    ) -> Result<ScoreOutcome, JobError> {
        let reading = self.generator.create_reading(profile, is_manual, actor).await?;
        Ok(self.scoring.score(reading.id, force).await?)
    }

    async fn collect(&self) -> Result<ScoreOutcome, JobError> {
        self.simulate(ReadingProfile::Normal, ForceFlags::default(), false, None)
            .await
    }

    async fn scheduled_backup(&self) -> Result<bool, JobError> {
        Ok(self.backup.backup(BackupRequest::scheduled()).await?)
    }

    async fn maintenance(&self) -> Result<MaintenanceReport, JobError> {
        let retention = self.retention.enforce().await?;
        let log_rotated = self
            .log_rotator
            .rotate_if_needed(self.clock.now())
            .map_err(JobError::LogRotation)?;
        Ok(MaintenanceReport {
            retention,
            log_rotated,
        })
    }

    /// Claim the runner for an operator task or report who holds it.
    fn claim(&self, requested: RunnerTask) -> Result<JobGuard<'_>, JobError> {
        self.runner.try_acquire(requested).ok_or_else(|| JobError::Busy {
            requested,
            running: self.runner.current().unwrap_or(requested),
        })
    }

    /// Restore readings from an artifact; refused while a job runs.
    pub async fn restore(&self, artifact: &str, actor: Option<&str>) -> Result<RestoreSummary, JobError> {
        let _guard = self.claim(RunnerTask::Restore)?;
        Ok(self.backup.restore(artifact, actor).await?)
    }

    /// Backfill `days` of history; refused while a job runs.
    pub fn seed_history(&self, days: u32, interval: Option<Duration>) -> Result<SeededHistory, JobError> {
        let _guard = self.claim(RunnerTask::SeedHistory)?;
        Ok(self.generator.seed_history(days, interval)?)
    }

    /// Score every unscored reading; refused while a job runs.
    pub async fn score_unscored(&self) -> Result<BatchScoreReport, JobError> {
        let _guard = self.claim(RunnerTask::ScoreUnscored)?;
        Ok(self.scoring.score_unscored().await?)
    }

    /// Apply `key=value` edits to the stored settings. Every pair is
    /// validated before anything is written.
    pub fn update_settings(
        &self,
        pairs: &[(String, String)],
        actor: Option<&str>,
    ) -> Result<Arc<Settings>, JobError> {
        let mut edited = Settings::clone(&*self.settings.refresh()?);
        for (key, value) in pairs {
            edited.set_field(key, value)?;
        }
        Ok(self
            .settings
            .update(|s| *s = edited, actor, self.clock.now())?)
    }

    /// Run one job unless another is in progress.
    pub async fn run_job(&self, kind: JobKind) -> Result<JobOutcome, JobError> {
        let Some(_guard) = self.runner.try_acquire(kind) else {
            tracing::info!(job = %kind, "Job skipped, another job is running");
            return Ok(JobOutcome::Skipped);
        };

        tracing::info!(job = %kind, "Running job");
        let outcome = match kind {
            JobKind::Collect => JobOutcome::Collected(self.collect().await?),
            JobKind::Backup => JobOutcome::BackedUp(self.scheduled_backup().await?),
            JobKind::Maintenance => JobOutcome::Maintained(self.maintenance().await?),
        };
        tracing::info!(job = %kind, "Job completed");
        Ok(outcome)
    }
}
