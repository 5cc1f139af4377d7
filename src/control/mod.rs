//! Operator control channel
//!
//! A running scheduler owns the store, so operator commands are sent to it
//! over a Unix socket under `[scheduler].pid_dir`:
//!
//! - `protocol`: JSON-line request and response types
//! - `dispatch`: executes a request against [`crate::pipeline::Services`]
//! - `server`: the listener run next to the scheduler loop
//! - `client`: used by the CLI, which falls back to opening the store itself
//!   when no scheduler is listening

pub mod dispatch;
pub mod protocol;
#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;

pub use dispatch::dispatch;
pub use protocol::{ControlReply, ControlRequest, ControlResponse};
#[cfg(unix)]
pub use client::ControlClient;
#[cfg(unix)]
pub use server::{ControlError, ControlServer};
