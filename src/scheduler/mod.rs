//! Background scheduling
//!
//! - `plan`: pure fire-time computation and the job table
//! - `runner`: at-most-one-mutating-task guard
//! - `task_scheduler`: the polling loop and the in-process lifecycle handle
//! - `process`: start/stop/status of a detached scheduler process

pub mod plan;
pub mod process;
pub mod runner;
pub mod task_scheduler;

pub use plan::{next_daily_fire, next_fire_time, JobKind, JobTable};
pub use process::{ProcessControl, ProcessError, ProcessStart, ProcessStatus, ProcessStop};
pub use runner::{JobGuard, JobRunner, RunnerTask};
pub use task_scheduler::{SchedulerHandle, SchedulerStatus, StartOutcome, StopOutcome, TaskScheduler};
