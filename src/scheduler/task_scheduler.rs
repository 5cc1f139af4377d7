//! The background scheduler loop and its in-process lifecycle handle.
//!
//! The loop polls a [`JobTable`] once per tick and runs due jobs one after
//! another. Settings are re-read on a fixed cadence and the table is
//! re-planned from the fresh snapshot, so cadence changes made by an
//! operator take effect without a restart.

use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::plan::{JobKind, JobTable};
use crate::config::SchedulerConfig;
use crate::pipeline::{JobError, JobOutcome, Services};

// ============================================================================
// Scheduler loop
// ============================================================================

pub struct TaskScheduler {
    services: Arc<Services>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(services: Arc<Services>) -> Self {
        let config = services.config.scheduler.clone();
        Self { services, config }
    }

    /// Run until `cancel` fires.
    ///
    /// Cancellation is observed between jobs; a job already running
    /// completes first. Returns `Err` only for fatal errors (missing
    /// models); every other job failure is logged and the loop goes on.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), JobError> {
        let tz = Local;
        let started_at = self.services.clock.now();
        let mut settings = self.services.settings.get();
        let mut table = JobTable::new(&settings, started_at, started_at, &tz);

        info!(
            collect_every = ?settings.collection_interval(),
            backup_every = ?settings.backup_interval(),
            maintenance_at = %settings.maintenance_time,
            "[Scheduler] Starting"
        );

        if self.config.run_maintenance_on_start {
            self.run_one(JobKind::Maintenance).await?;
        }

        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_millis.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let reload_every = Duration::from_secs(self.config.settings_reload_secs.max(1));
        let mut last_reload = Instant::now();
        let mut jobs_run = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Scheduler] Received shutdown signal after {} jobs", jobs_run);
                    return Ok(());
                }
                _ = interval.tick() => {
                    if last_reload.elapsed() >= reload_every {
                        last_reload = Instant::now();
                        match self.services.settings.refresh() {
                            Ok(fresh) => {
                                settings = fresh;
                                table.replan(&settings, self.services.clock.now(), &tz);
                                tracing::debug!(next_due = ?table.next_due(), "[Scheduler] Settings reloaded");
                            }
                            Err(e) => {
                                warn!(error = %e, "[Scheduler] Settings reload failed, keeping previous schedule");
                            }
                        }
                    }

                    for kind in table.due(self.services.clock.now()) {
                        if cancel.is_cancelled() {
                            break;
                        }
                        self.run_one(kind).await?;
                        jobs_run += 1;
                        table.mark_ran(kind, self.services.clock.now(), &settings, &tz);
                    }
                }
            }
        }
    }

    /// Run one job and classify its failure.
    async fn run_one(&self, kind: JobKind) -> Result<(), JobError> {
        match self.services.run_job(kind).await {
            Ok(JobOutcome::Collected(outcome)) => {
                tracing::debug!(reading_id = outcome.reading.id, backup = outcome.backup_performed, "[Scheduler] Collected");
            }
            Ok(JobOutcome::Maintained(report)) => {
                tracing::debug!(
                    readings_deleted = report.retention.readings_deleted,
                    backups_removed = report.retention.backups.removed(),
                    log_rotated = report.log_rotated,
                    "[Scheduler] Maintenance done"
                );
            }
            Ok(JobOutcome::BackedUp(_) | JobOutcome::Skipped) => {}
            Err(e) if e.is_fatal() => {
                error!(job = %kind, error = %e, "[Scheduler] Fatal job error, stopping");
                return Err(e);
            }
            Err(e) if e.is_transient() => {
                warn!(job = %kind, error = %e, "[Scheduler] Storage error, resetting store");
                if let Err(reset) = self.services.store.recover_after_error() {
                    error!(error = %reset, "[Scheduler] Store reset failed");
                }
            }
            Err(e) => {
                error!(job = %kind, error = %e, "[Scheduler] Job failed");
            }
        }
        Ok(())
    }
}

// ============================================================================
// In-process lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { started_at: DateTime<Utc> },
    /// Start is idempotent: the existing instance is reported.
    AlreadyRunning { started_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// The loop observed cancellation and returned.
    Stopped,
    /// A job outlived the stop timeout and the task was aborted.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Running {
        started_at: DateTime<Utc>,
        uptime: chrono::Duration,
    },
    Stopped,
}

struct RunningScheduler {
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), JobError>>,
}

/// Start/stop/restart/status for a scheduler embedded in this process.
pub struct SchedulerHandle {
    services: Arc<Services>,
    running: Mutex<Option<RunningScheduler>>,
}

impl SchedulerHandle {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            running: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> StartOutcome {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref().filter(|r| !r.task.is_finished()) {
            info!(started_at = %current.started_at, "[Scheduler] Already running");
            return StartOutcome::AlreadyRunning {
                started_at: current.started_at,
            };
        }

        let cancel = CancellationToken::new();
        let scheduler = TaskScheduler::new(Arc::clone(&self.services));
        let token = cancel.clone();
        let task = tokio::spawn(async move { scheduler.run(token).await });
        let started_at = self.services.clock.now();
        *running = Some(RunningScheduler {
            started_at,
            cancel,
            task,
        });
        info!(%started_at, "[Scheduler] Started");
        StartOutcome::Started { started_at }
    }

    /// Request shutdown, wait up to the stop timeout, then abort. An
    /// aborted job is dropped mid-flight; its runner slot is released
    /// before this returns.
    pub async fn stop(&self) -> StopOutcome {
        let Some(current) = self.running.lock().await.take() else {
            info!("[Scheduler] Not running");
            return StopOutcome::NotRunning;
        };
        if current.task.is_finished() {
            return StopOutcome::NotRunning;
        }

        current.cancel.cancel();
        let timeout = Duration::from_secs(self.services.config.scheduler.stop_timeout_secs);
        let mut task = current.task;
        let joined = tokio::time::timeout(timeout, &mut task).await;
        match joined {
            Ok(Ok(Ok(()))) => info!("[Scheduler] Stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "[Scheduler] Stopped after fatal error"),
            Ok(Err(e)) => error!("[Scheduler] Task panicked: {}", e),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "[Scheduler] Did not stop in time, aborting");
                task.abort();
                if let Err(e) = task.await {
                    tracing::debug!(cancelled = e.is_cancelled(), "[Scheduler] Aborted task joined");
                }
                return StopOutcome::Aborted;
            }
        }
        StopOutcome::Stopped
    }

    pub async fn restart(&self) -> StartOutcome {
        self.stop().await;
        tokio::time::sleep(Duration::from_secs(
            self.services.config.scheduler.restart_settle_secs,
        ))
        .await;
        self.start().await
    }

    pub async fn status(&self) -> SchedulerStatus {
        match self.running.lock().await.as_ref() {
            Some(current) if !current.task.is_finished() => SchedulerStatus::Running {
                started_at: current.started_at,
                uptime: self.services.clock.now() - current.started_at,
            },
            _ => SchedulerStatus::Stopped,
        }
    }
}
