//! Backups of the readings table: trigger policy, dump tools, SQL-text
//! artifacts and the coordinator that ties them together.

pub mod artifact;
pub mod coordinator;
pub mod dump;
pub mod policy;

pub use coordinator::{BackupCoordinator, BackupError, BackupRequest, CleanupReport, RestoreSummary};
pub use dump::{CommandDumpTool, DumpError, DumpTool, NativeDumpTool};
pub use policy::ReasonPolicy;

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{BackupConfig, DumpMode};
use crate::storage::Store;

/// Dump tool selected by `[backup].mode`.
pub fn dump_tool_for(config: &BackupConfig, store: Store, clock: Arc<dyn Clock>) -> Arc<dyn DumpTool> {
    match config.mode {
        DumpMode::Native => Arc::new(NativeDumpTool::new(store, config.table.clone(), clock)),
        DumpMode::Command => {
            tracing::warn!(
                program = %config.command.program,
                "Command dump mode: artifacts are PostgreSQL exports and cannot be restored"
            );
            Arc::new(CommandDumpTool::new(config.command.clone()))
        }
    }
}
