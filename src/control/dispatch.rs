//! Execute one operator request against the services of this process.
//!
//! The control server calls this for requests arriving over the socket and
//! the CLI calls it directly when no scheduler is running, so both paths
//! share the same semantics.

use chrono::Duration;

use super::protocol::{ControlReply, ControlRequest};
use crate::config::defaults;
use crate::pipeline::{JobError, JobOutcome, Services};
use crate::scheduler::JobKind;
use crate::simulation::GeneratorError;

pub async fn dispatch(services: &Services, request: ControlRequest) -> Result<ControlReply, JobError> {
    let reply = match request {
        ControlRequest::Simulate { profile, force, actor } => ControlReply::Scored {
            outcome: services.simulate(profile, force, true, actor.as_deref()).await?,
        },
        ControlRequest::Backup { request } => ControlReply::BackedUp {
            performed: services.backup.backup(request).await?,
        },
        ControlRequest::Restore { artifact, actor } => ControlReply::Restored {
            summary: services.restore(&artifact, actor.as_deref()).await?,
        },
        ControlRequest::DeleteBackup { artifact } => {
            services.backup.delete_artifact(&artifact).await?;
            ControlReply::Deleted { artifact }
        }
        ControlRequest::ListBackups { limit } => {
            let mut records = services.backup.list_backups()?;
            let summary = services.backup.summary()?;
            records.truncate(limit);
            ControlReply::Backups { summary, records }
        }
        ControlRequest::Readings { limit } => ControlReply::Readings {
            total: services.store.reading_count(),
            readings: services.store.recent_readings(limit)?,
        },
        ControlRequest::SettingsShow => ControlReply::Settings {
            settings: (*services.settings.refresh()?).clone(),
        },
        ControlRequest::SettingsSet { pairs, actor } => ControlReply::Settings {
            settings: (*services.update_settings(&pairs, actor.as_deref())?).clone(),
        },
        ControlRequest::Maintenance => match services.run_job(JobKind::Maintenance).await? {
            JobOutcome::Maintained(report) => ControlReply::Maintained { report: Some(report) },
            _ => ControlReply::Maintained { report: None },
        },
        ControlRequest::SeedHistory {
            days,
            interval_minutes,
        } => {
            let interval = interval_minutes.map(history_interval).transpose()?;
            ControlReply::Seeded {
                history: services.seed_history(days, interval)?,
            }
        }
        ControlRequest::ScoreUnscored => ControlReply::ScoredBatch {
            report: services.score_unscored().await?,
        },
    };
    Ok(reply)
}

fn history_interval(minutes: i64) -> Result<Duration, JobError> {
    if minutes <= 0 || minutes > defaults::MAX_DATA_COLLECTION_INTERVAL_MINUTES {
        return Err(GeneratorError::History(format!(
            "interval must be between 1 and {} minutes, got {minutes}",
            defaults::MAX_DATA_COLLECTION_INTERVAL_MINUTES
        ))
        .into());
    }
    Duration::try_minutes(minutes)
        .ok_or_else(|| GeneratorError::History(format!("{minutes} minutes is out of range")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_interval_bounds() {
        assert_eq!(history_interval(15).unwrap(), Duration::minutes(15));
        assert!(history_interval(0).is_err());
        assert!(history_interval(i64::MAX).is_err());
    }
}
