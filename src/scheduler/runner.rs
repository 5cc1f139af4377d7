//! Job overlap guard.
//!
//! At most one mutating task runs at a time: a scheduled job, a restore, a
//! history seed or a batch scoring pass. A scheduled job that finds the
//! runner busy is skipped until its next natural firing; an operator task
//! is refused with the name of whatever holds the runner.

use std::fmt;
use std::sync::Mutex;

use super::plan::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerTask {
    Job(JobKind),
    Restore,
    SeedHistory,
    ScoreUnscored,
}

impl From<JobKind> for RunnerTask {
    fn from(kind: JobKind) -> Self {
        RunnerTask::Job(kind)
    }
}

impl fmt::Display for RunnerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerTask::Job(kind) => kind.fmt(f),
            RunnerTask::Restore => write!(f, "restore"),
            RunnerTask::SeedHistory => write!(f, "seed-history"),
            RunnerTask::ScoreUnscored => write!(f, "score-unscored"),
        }
    }
}

#[derive(Debug, Default)]
pub struct JobRunner {
    current: Mutex<Option<RunnerTask>>,
}

/// Held while a task runs; releases the runner on drop.
#[derive(Debug)]
pub struct JobGuard<'a> {
    runner: &'a JobRunner,
    task: RunnerTask,
}

impl JobGuard<'_> {
    pub fn task(&self) -> RunnerTask {
        self.task
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.runner.release();
    }
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the runner for `task`; `None` if another task holds it.
    pub fn try_acquire(&self, task: impl Into<RunnerTask>) -> Option<JobGuard<'_>> {
        let task = task.into();
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = *current {
            tracing::debug!(task = %task, running = %running, "Job runner busy");
            return None;
        }
        *current = Some(task);
        Some(JobGuard { runner: self, task })
    }

    fn release(&self) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// The task currently running, if any.
    pub fn current(&self) -> Option<RunnerTask> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_task_is_refused_until_release() {
        let runner = JobRunner::new();
        let guard = runner.try_acquire(JobKind::Backup).unwrap();
        assert_eq!(guard.task(), RunnerTask::Job(JobKind::Backup));
        assert!(runner.try_acquire(JobKind::Collect).is_none());
        assert!(runner.try_acquire(RunnerTask::Restore).is_none());
        assert_eq!(runner.current(), Some(RunnerTask::Job(JobKind::Backup)));

        drop(guard);
        assert_eq!(runner.current(), None);
        let restore = runner.try_acquire(RunnerTask::Restore).unwrap();
        assert_eq!(restore.task().to_string(), "restore");
    }
}
