//! gridwarden - energy monitoring with anomaly-triggered backups
//!
//! # Usage
//!
//! ```bash
//! # Run the scheduler in the foreground
//! gridwarden run
//!
//! # Manage a detached scheduler
//! gridwarden start | stop | restart | status
//!
//! # One-off operations (served by the running scheduler when there is one)
//! gridwarden simulate --profile anomaly --force-anomaly
//! gridwarden backup --force
//! gridwarden restore energy_data_20250301_120000.sql
//! gridwarden settings set data_collection_interval_minutes=5
//!
//! # Backfill and score history
//! gridwarden seed-history --days 30
//! gridwarden score-unscored
//! ```
//!
//! # Environment Variables
//!
//! - `GRIDWARDEN_CONFIG`: Path to the TOML config (default: ./gridwarden.toml)
//! - `RUST_LOG`: Logging filter (default: `[logging].level`, then info)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gridwarden::backup::BackupRequest;
use gridwarden::config::{defaults, AppConfig, LoggingConfig};
use gridwarden::control::{dispatch, ControlReply, ControlRequest};
use gridwarden::ml_engine::ForceFlags;
use gridwarden::pipeline::Services;
use gridwarden::scheduler::{ProcessControl, ProcessStart, ProcessStatus, ProcessStop, TaskScheduler};
use gridwarden::storage::ProcessLock;
use gridwarden::types::{Reading, ReadingProfile, Settings, TriggerReason};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "gridwarden")]
#[command(about = "Energy monitoring with anomaly- and forecast-triggered backups")]
#[command(version)]
struct CliArgs {
    /// Config file (default: $GRIDWARDEN_CONFIG, then ./gridwarden.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Run the scheduler in the foreground until SIGTERM / Ctrl+C
    Run,
    /// Start a detached scheduler process
    Start,
    /// Stop the detached scheduler (SIGTERM, then SIGKILL after the timeout)
    Stop,
    /// Stop, settle, start
    Restart,
    /// Show whether the scheduler runs, since when, and its latest log lines
    Status {
        /// Number of log lines to show
        #[arg(long, default_value_t = defaults::STATUS_LOG_TAIL_LINES)]
        lines: usize,
    },
    /// Create a manual reading and run it through scoring and the backup check
    Simulate {
        /// normal | anomaly | abnormal-forecast
        #[arg(long, default_value = "normal")]
        profile: ReadingProfile,
        /// Flag the reading anomalous regardless of the model
        #[arg(long)]
        force_anomaly: bool,
        /// Push the forecast out of bounds regardless of the model
        #[arg(long)]
        force_abnormal: bool,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Take a backup now
    Backup {
        /// Reading that justifies the backup
        #[arg(long)]
        reading: Option<u64>,
        /// Back up even if no flag is set (reason: manual)
        #[arg(long)]
        force: bool,
        /// Explicit reason: anomaly | abnormal-forecast | manual | scheduled
        #[arg(long)]
        reason: Option<TriggerReason>,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Replace all readings with the contents of a backup artifact
    Restore {
        artifact: String,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Delete a backup artifact and its record
    DeleteBackup { artifact: String },
    /// List backup records, newest first
    ListBackups {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the most recent readings
    Readings {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show or edit the persisted operator settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Run retention and log rotation once
    Maintenance,
    /// Backfill past readings (unscored) ending now
    SeedHistory {
        #[arg(long, default_value_t = defaults::HISTORY_DAYS)]
        days: u32,
        /// Spacing between readings (default: the collection interval)
        #[arg(long)]
        interval_minutes: Option<i64>,
    },
    /// Score every reading that has not been scored yet, oldest first
    ScoreUnscored,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Show,
    /// Set one or more fields: `key=value ...`
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        pairs: Vec<String>,
        #[arg(long)]
        actor: Option<String>,
    },
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging(config: &LoggingConfig, to_file: bool) -> Result<()> {
    let default_level = config.level.clone().unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file = match (&config.file, to_file) {
        (Some(path), true) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(Mutex::new(file))
        }
        _ => None,
    };

    let (file_json, file_plain) = match file {
        Some(writer) if config.json => (Some(fmt::layer().json().with_writer(writer)), None),
        Some(writer) => (None, Some(fmt::layer().with_ansi(false).with_writer(writer))),
        None => (None, None),
    };
    let stderr_json = config
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let stderr_plain = (!config.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_json)
        .with(stderr_plain)
        .with(file_json)
        .with(file_plain)
        .init();
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(p) => AppConfig::load_from_file(p)
            .with_context(|| format!("Failed to load config: {}", p.display())),
        None => Ok(AppConfig::load()),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM ({}), Ctrl+C only", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
}

async fn run_scheduler(config: AppConfig) -> Result<()> {
    let _lock = ProcessLock::acquire(&config.scheduler.pid_dir)?;
    let services = Arc::new(Services::open(config)?);

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  gridwarden scheduler (pid {})", std::process::id());
    info!("  data: {}", services.config.storage.data_dir.display());
    info!("  backups: {}", services.backup.backup_dir().display());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Graceful shutdown via SIGTERM / Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("🛑 Shutdown signal received");
        shutdown_token.cancel();
    });

    // Operator commands reach the store through this process
    #[cfg(unix)]
    let control_task = {
        let server = gridwarden::control::ControlServer::bind(
            services.config.scheduler.control_socket_path(),
            Arc::clone(&services),
        )?;
        info!("  control: {}", server.path().display());
        tokio::spawn(server.serve(cancel_token.clone()))
    };

    let result = TaskScheduler::new(Arc::clone(&services))
        .run(cancel_token.clone())
        .await
        .context("Scheduler stopped on a fatal error");
    cancel_token.cancel();
    #[cfg(unix)]
    if let Err(e) = control_task.await {
        warn!("Control server task failed: {}", e);
    }
    result?;
    services.store.flush()?;
    info!("✓ gridwarden scheduler shutdown complete");
    Ok(())
}

fn print_reading(reading: &Reading) {
    let m = &reading.measurements;
    println!(
        "#{:<6} {}  ac={:.1}V batt={:.2}V cur={:.2}A load={:.0}W temp={:.1}°C",
        reading.id,
        reading.timestamp.format("%Y-%m-%d %H:%M:%S"),
        m.ac_output_voltage,
        m.dc_battery_voltage,
        m.dc_battery_current,
        m.load_power,
        m.temperature
    );
    match &reading.scoring {
        Some(s) => {
            let level = reading
                .anomaly_level()
                .map_or_else(String::new, |l| format!(" ({l})"));
            println!(
                "        anomaly={} score={:.3}{}  forecast cur={:.2}A ac={:.1}V abnormal={}  backed_up={}",
                s.is_anomaly,
                s.anomaly_score,
                level,
                s.forecast.dc_battery_current,
                s.forecast.ac_output_voltage,
                s.is_abnormal_prediction,
                reading.backup_triggered
            );
            if let Some(text) = s.reason_text() {
                println!("        reasons: {text}");
            }
        }
        None => println!("        (not scored)"),
    }
}

fn print_settings(settings: &Settings) -> Result<()> {
    print!("{}", toml::to_string_pretty(settings).context("Failed to render settings")?);
    Ok(())
}

fn parse_pair(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => bail!("Expected KEY=VALUE, got '{}'", pair),
    }
}

async fn run_process_command(config: &AppConfig, config_path: Option<PathBuf>, command: &SubCommand) -> Result<()> {
    let control = ProcessControl::new(config, config_path)?;
    match command {
        SubCommand::Start | SubCommand::Restart => {
            let started = if matches!(command, SubCommand::Restart) {
                control.restart().await?
            } else {
                control.start().await?
            };
            match started {
                ProcessStart::Started { pid } => {
                    println!("Scheduler started (PID: {pid}), log: {}", control.log_path().display());
                }
                ProcessStart::AlreadyRunning(record) => {
                    println!("Scheduler already running (PID: {})", record.pid);
                }
            }
        }
        SubCommand::Stop => match control.stop().await? {
            ProcessStop::Stopped { pid, forced: false } => println!("Scheduler stopped (PID: {pid})"),
            ProcessStop::Stopped { pid, forced: true } => println!("Scheduler killed (PID: {pid})"),
            ProcessStop::NotRunning => println!("Scheduler is not running"),
        },
        SubCommand::Status { lines } => {
            match control.status() {
                ProcessStatus::Running { pid, started_at, uptime } => {
                    println!("Scheduler is running (PID: {pid})");
                    if let Some(at) = started_at {
                        println!("Started: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
                    }
                    if let Some(up) = uptime {
                        println!(
                            "Uptime: {}h {}m {}s",
                            up.num_hours(),
                            up.num_minutes() % 60,
                            up.num_seconds() % 60
                        );
                    }
                }
                ProcessStatus::Stopped => println!("Scheduler is not running"),
            }
            let tail = control.log_tail(*lines);
            if !tail.is_empty() {
                println!("\nRecent log ({}):", control.log_path().display());
                for line in tail {
                    println!("  {line}");
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Translate a one-off subcommand into a control request.
fn control_request(command: SubCommand) -> Result<Option<ControlRequest>> {
    let request = match command {
        SubCommand::Simulate {
            profile,
            force_anomaly,
            force_abnormal,
            actor,
        } => ControlRequest::Simulate {
            profile,
            force: ForceFlags {
                anomaly: force_anomaly,
                abnormal_forecast: force_abnormal,
            },
            actor,
        },
        SubCommand::Backup {
            reading,
            force,
            reason,
            actor,
        } => ControlRequest::Backup {
            request: BackupRequest {
                reading_id: reading,
                force,
                reason,
                actor,
            },
        },
        SubCommand::Restore { artifact, actor } => ControlRequest::Restore { artifact, actor },
        SubCommand::DeleteBackup { artifact } => ControlRequest::DeleteBackup { artifact },
        SubCommand::ListBackups { limit } => ControlRequest::ListBackups { limit },
        SubCommand::Readings { limit } => ControlRequest::Readings { limit },
        SubCommand::Settings { action } => match action {
            SettingsAction::Show => ControlRequest::SettingsShow,
            SettingsAction::Set { pairs, actor } => ControlRequest::SettingsSet {
                pairs: pairs
                    .iter()
                    .map(|pair| parse_pair(pair).map(|(k, v)| (k.to_string(), v.to_string())))
                    .collect::<Result<_>>()?,
                actor,
            },
        },
        SubCommand::Maintenance => ControlRequest::Maintenance,
        SubCommand::SeedHistory { days, interval_minutes } => ControlRequest::SeedHistory {
            days,
            interval_minutes,
        },
        SubCommand::ScoreUnscored => ControlRequest::ScoreUnscored,
        SubCommand::Run
        | SubCommand::Start
        | SubCommand::Stop
        | SubCommand::Restart
        | SubCommand::Status { .. } => return Ok(None),
    };
    Ok(Some(request))
}

/// Send the request to a running scheduler; `None` when none is listening.
#[cfg(unix)]
async fn via_scheduler(config: &AppConfig, request: &ControlRequest) -> Result<Option<ControlReply>> {
    use gridwarden::control::{ControlClient, ControlError};

    let client = ControlClient::from_config(config);
    match client.send(request).await {
        Ok(Ok(reply)) => Ok(Some(reply)),
        Ok(Err(message)) => bail!("{}", message),
        Err(ControlError::Unavailable(_)) => Ok(None),
        Err(e) => Err(e).with_context(|| {
            format!("Failed to reach the running scheduler at {}", client.path().display())
        }),
    }
}

#[cfg(not(unix))]
async fn via_scheduler(_config: &AppConfig, _request: &ControlRequest) -> Result<Option<ControlReply>> {
    Ok(None)
}

async fn run_command(config: AppConfig, command: SubCommand) -> Result<()> {
    let Some(request) = control_request(command)? else {
        return Ok(());
    };

    if let Some(reply) = via_scheduler(&config, &request).await? {
        print_reply(&reply)?;
        if matches!(request, ControlRequest::SettingsSet { .. }) {
            println!("# Applied by the running scheduler");
        }
        return Ok(());
    }

    let services = Services::open(config)?;
    let reply = dispatch(&services, request).await?;
    services.store.flush()?;
    print_reply(&reply)
}

fn print_reply(reply: &ControlReply) -> Result<()> {
    match reply {
        ControlReply::Scored { outcome } => {
            print_reading(&outcome.reading);
            if outcome.backup_performed {
                println!("Backup created for reading #{}", outcome.reading.id);
            }
        }
        ControlReply::BackedUp { performed: true } => println!("Backup completed"),
        ControlReply::BackedUp { performed: false } => {
            println!("No backup performed (nothing flagged, or the dump failed; see list-backups)");
        }
        ControlReply::Restored { summary } => println!(
            "Restored {} readings from {} (next id {})",
            summary.rows_restored,
            summary.artifact_name,
            summary.sequence + 1
        ),
        ControlReply::Deleted { artifact } => println!("Deleted {artifact}"),
        ControlReply::Backups { summary, records } => {
            println!(
                "{} backups ({} successful, {} failed)",
                summary.total, summary.successful, summary.failed
            );
            for record in records {
                println!(
                    "{}  {:<7} {:<17} {:>10} B  readings={:?}{}{}",
                    record.artifact_name,
                    record.status.to_string(),
                    record.trigger_reason.to_string(),
                    record.size_bytes,
                    record.triggered_by,
                    if record.export_only { "  (export only)" } else { "" },
                    record
                        .error_message
                        .as_deref()
                        .map_or_else(String::new, |e| format!("  error: {e}"))
                );
            }
        }
        ControlReply::Readings { total, readings } => {
            println!("{total} readings stored");
            for reading in readings {
                print_reading(reading);
            }
        }
        ControlReply::Settings { settings } => print_settings(settings)?,
        ControlReply::Maintained { report: Some(report) } => println!(
            "Deleted {} readings, removed {} backups ({} expired, {} over limit), {} orphaned records{}",
            report.retention.readings_deleted,
            report.retention.backups.removed(),
            report.retention.backups.expired.len(),
            report.retention.backups.over_limit.len(),
            report.retention.backups.orphaned_records.len(),
            if report.log_rotated { ", log rotated" } else { "" }
        ),
        ControlReply::Maintained { report: None } => {
            println!("Maintenance skipped, another job is running");
        }
        ControlReply::Seeded { history } => match (history.first, history.last) {
            (Some(first), Some(last)) => println!(
                "Seeded {} readings from {} to {} (unscored; run score-unscored)",
                history.readings,
                first.format("%Y-%m-%d %H:%M"),
                last.format("%Y-%m-%d %H:%M")
            ),
            _ => println!("No readings seeded"),
        },
        ControlReply::ScoredBatch { report } => println!(
            "Scored {} readings: {} anomalies, {} abnormal forecasts, {} backups",
            report.scored, report.anomalies, report.abnormal_forecasts, report.backups
        ),
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = load_config(args.config.as_ref())?;
    init_logging(&config.logging, matches!(args.command, SubCommand::Run))?;

    match args.command {
        SubCommand::Run => run_scheduler(config).await,
        command @ (SubCommand::Start
        | SubCommand::Stop
        | SubCommand::Restart
        | SubCommand::Status { .. }) => run_process_command(&config, args.config, &command).await,
        command => run_command(config, command).await,
    }
}
