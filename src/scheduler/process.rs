//! OS-level control of a detached scheduler process.
//!
//! `start` launches `gridwarden run` in its own process group and returns
//! once the child has written its pid file. `stop` signals the pid recorded
//! in that file, waits a bounded time, then kills it.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{defaults, AppConfig};
use crate::storage::lockfile::{is_scheduler_process, pid_file_path, read_pid_file, PidRecord};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("cannot locate the gridwarden executable: {0}")]
    CurrentExe(#[source] io::Error),
    #[error("failed to open log file {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },
    #[error("failed to spawn scheduler: {0}")]
    Spawn(#[source] io::Error),
    #[error("scheduler exited during startup ({status}); see {log}")]
    ExitedEarly { status: String, log: PathBuf },
    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: u32, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStart {
    Started { pid: u32 },
    AlreadyRunning(PidRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStop {
    Stopped { pid: u32, forced: bool },
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running {
        pid: u32,
        started_at: Option<DateTime<Utc>>,
        uptime: Option<chrono::Duration>,
    },
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ProcessControl {
    exe: PathBuf,
    config_path: Option<PathBuf>,
    pid_dir: PathBuf,
    log_path: PathBuf,
    /// Child writes its own log file; stdio is not redirected.
    child_logs_itself: bool,
    stop_timeout: Duration,
    settle: Duration,
}

impl ProcessControl {
    /// `config_path` is forwarded to the child as `--config`.
    pub fn new(config: &AppConfig, config_path: Option<PathBuf>) -> Result<Self, ProcessError> {
        let exe = std::env::current_exe().map_err(ProcessError::CurrentExe)?;
        let pid_dir = config.scheduler.pid_dir.clone();
        let log_path = config.scheduler_log_path();
        let child_logs_itself = config.logging.file.is_some();
        Ok(Self {
            exe,
            config_path,
            pid_dir,
            log_path,
            child_logs_itself,
            stop_timeout: Duration::from_secs(config.scheduler.stop_timeout_secs),
            settle: Duration::from_secs(config.scheduler.restart_settle_secs),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn pid_file(&self) -> PathBuf {
        pid_file_path(&self.pid_dir)
    }

    /// The live scheduler's pid record, if any.
    fn running(&self) -> Option<PidRecord> {
        read_pid_file(&self.pid_file()).filter(|r| is_scheduler_process(r.pid))
    }

    fn child_stdio(&self) -> Result<(Stdio, Stdio), ProcessError> {
        if self.child_logs_itself {
            return Ok((Stdio::null(), Stdio::null()));
        }
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).map_err(|source| ProcessError::LogFile {
                path: self.log_path.clone(),
                source,
            })?;
        }
        let open = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .map_err(|source| ProcessError::LogFile {
                    path: self.log_path.clone(),
                    source,
                })
        };
        Ok((Stdio::from(open()?), Stdio::from(open()?)))
    }

    pub async fn start(&self) -> Result<ProcessStart, ProcessError> {
        if let Some(existing) = self.running() {
            info!(pid = existing.pid, "Scheduler already running");
            return Ok(ProcessStart::AlreadyRunning(existing));
        }

        let (stdout, stderr) = self.child_stdio()?;
        let mut command = Command::new(&self.exe);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command
            .arg("run")
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(ProcessError::Spawn)?;
        let pid = child.id();
        info!(pid, log = %self.log_path.display(), "Scheduler process spawned");

        tokio::time::sleep(Duration::from_secs(defaults::START_CHECK_DELAY_SECS)).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ProcessError::ExitedEarly {
                status: status.to_string(),
                log: self.log_path.clone(),
            });
        }
        match read_pid_file(&self.pid_file()) {
            Some(record) if record.pid == pid => {}
            _ => warn!(pid, "Scheduler is up but has not written its pid file yet"),
        }
        Ok(ProcessStart::Started { pid })
    }

    pub async fn stop(&self) -> Result<ProcessStop, ProcessError> {
        let Some(record) = self.running() else {
            self.remove_pid_file();
            info!("Scheduler not running");
            return Ok(ProcessStop::NotRunning);
        };
        let pid = record.pid;

        send_signal(pid, Signal::Terminate)?;
        info!(pid, "Sent SIGTERM to scheduler");

        let poll = Duration::from_millis(defaults::STOP_POLL_MILLIS);
        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        while tokio::time::Instant::now() < deadline {
            if !is_scheduler_process(pid) {
                self.remove_pid_file();
                info!(pid, "Scheduler stopped");
                return Ok(ProcessStop::Stopped { pid, forced: false });
            }
            tokio::time::sleep(poll).await;
        }

        warn!(pid, timeout_secs = self.stop_timeout.as_secs(), "Scheduler did not stop, sending SIGKILL");
        send_signal(pid, Signal::Kill)?;
        self.remove_pid_file();
        Ok(ProcessStop::Stopped { pid, forced: true })
    }

    pub async fn restart(&self) -> Result<ProcessStart, ProcessError> {
        self.stop().await?;
        tokio::time::sleep(self.settle).await;
        self.start().await
    }

    pub fn status(&self) -> ProcessStatus {
        match self.running() {
            Some(record) => ProcessStatus::Running {
                pid: record.pid,
                started_at: record.started_at,
                uptime: record.started_at.map(|at| Utc::now() - at),
            },
            None => ProcessStatus::Stopped,
        }
    }

    /// Last `n` lines of the scheduler log; empty when there is none.
    pub fn log_tail(&self, n: usize) -> Vec<String> {
        match fs::read_to_string(&self.log_path) {
            Ok(contents) => tail_lines(&contents, n),
            Err(_) => Vec::new(),
        }
    }

    fn remove_pid_file(&self) {
        match fs::remove_file(self.pid_file()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove pid file"),
        }
    }
}

fn tail_lines(contents: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = contents.lines().collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| (*l).to_string())
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    let raw_pid = libc::pid_t::try_from(pid).map_err(|_| ProcessError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(raw_pid, signo) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // Exited between the liveness check and the signal.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(ProcessError::Signal { pid, source: err })
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) -> Result<(), ProcessError> {
    Err(ProcessError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::Unsupported),
    })
}
