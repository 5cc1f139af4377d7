//! Shared data structures for the monitoring and backup pipeline
//!
//! - `reading`: Reading, Measurements, feature vector, scoring annotations
//! - `backup`: BackupRecord, TriggerReason, reason-order rules
//! - `settings`: the operator-tunable Settings record

mod backup;
mod reading;
mod settings;

pub use backup::*;
pub use reading::*;
pub use settings::*;
