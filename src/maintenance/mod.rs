//! Housekeeping: reading/backup retention and log rotation.

pub mod log_rotation;
pub mod retention;

pub use log_rotation::LogRotator;
pub use retention::{RetentionManager, RetentionReport};
