//! Backup coordinator scenarios
//!
//! End-to-end flows through `Services`: scoring-triggered backups, the
//! artifact-name dedup, failure recording and retry, scheduled snapshots,
//! restore and cleanup.

mod common;

use chrono::{Duration, Utc};
use std::fs;
use std::time::SystemTime;

use common::*;
use gridwarden::clock::Clock;
use gridwarden::backup::{BackupError, BackupRequest};
use gridwarden::ml_engine::ForceFlags;
use gridwarden::pipeline::JobOutcome;
use gridwarden::scheduler::JobKind;
use gridwarden::types::{BackupStatus, ReadingProfile, TriggerReason};

// ============================================================================
// Trigger and dedup
// ============================================================================

#[tokio::test]
async fn normal_reading_triggers_no_backup() {
    let h = scripted_harness(ScriptedDump::default());
    let reading = insert(&h, nominal());

    let outcome = h.services.scoring.score(reading.id, ForceFlags::default()).await.unwrap();
    let result = outcome.result().unwrap();
    assert!(!result.is_anomaly);
    assert!(!result.is_abnormal_prediction);
    assert!(!outcome.backup_performed);

    assert!(!h.services.backup.check_and_backup_if_needed(reading.id).await.unwrap());
    assert!(!h.services.backup.backup(BackupRequest::for_reading(reading.id)).await.unwrap());
    assert!(h.services.backup.list_backups().unwrap().is_empty());
    assert_eq!(h.dump.calls(), 0);
}

#[tokio::test]
async fn forced_anomaly_backs_up_once() {
    let h = scripted_harness(ScriptedDump::default());
    let force = ForceFlags {
        anomaly: true,
        abnormal_forecast: false,
    };

    let outcome = h
        .services
        .simulate(ReadingProfile::Anomaly, force, true, Some("operator"))
        .await
        .unwrap();
    let reading = &outcome.reading;
    assert!(reading.is_anomaly());
    assert!(!reading.scoring.as_ref().unwrap().reasons.is_empty());
    assert!(reading.is_manual);
    assert_eq!(reading.created_by.as_deref(), Some("operator"));
    assert!(outcome.backup_performed);
    assert!(reading.backup_triggered);

    let records = h.services.backup.list_backups().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::Success);
    assert_eq!(records[0].trigger_reason, TriggerReason::Anomaly);
    assert!(records[0].triggered_by.contains(&reading.id));

    // a second check on the same reading is a no-op
    assert!(!h.services.backup.check_and_backup_if_needed(reading.id).await.unwrap());
    assert_eq!(h.dump.calls(), 1);
}

#[tokio::test]
async fn anomaly_outranks_abnormal_forecast() {
    let h = scripted_harness(ScriptedDump::default());
    let reading = insert(&h, nominal());
    let both = ForceFlags {
        anomaly: true,
        abnormal_forecast: true,
    };

    let outcome = h.services.scoring.score(reading.id, both).await.unwrap();
    assert!(outcome.reading.is_anomaly());
    assert!(outcome.reading.is_abnormal_prediction());
    assert!(outcome.backup_performed);

    let records = h.services.backup.list_backups().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].trigger_reason, TriggerReason::Anomaly);
}

#[tokio::test]
async fn forced_abnormal_forecast_records_its_reason() {
    let h = scripted_harness(ScriptedDump::default());
    let reading = insert(&h, nominal());
    let force = ForceFlags {
        anomaly: false,
        abnormal_forecast: true,
    };

    let outcome = h.services.scoring.score(reading.id, force).await.unwrap();
    assert!(!outcome.reading.is_anomaly());
    assert!(outcome.backup_performed);
    let records = h.services.backup.list_backups().unwrap();
    assert_eq!(records[0].trigger_reason, TriggerReason::AbnormalForecast);
}

#[tokio::test]
async fn explicit_reason_backs_up_unflagged_reading() {
    let h = scripted_harness(ScriptedDump::default());
    let reading = insert(&h, nominal());

    let request = BackupRequest {
        reading_id: Some(reading.id),
        reason: Some(TriggerReason::Scheduled),
        ..BackupRequest::default()
    };
    assert!(h.services.backup.backup(request).await.unwrap());
    let records = h.services.backup.list_backups().unwrap();
    assert_eq!(records[0].trigger_reason, TriggerReason::Scheduled);
    assert!(records[0].triggered_by.contains(&reading.id));
    assert!(h.services.store.require_reading(reading.id).unwrap().backup_triggered);
}

#[tokio::test]
async fn same_second_backups_share_one_record() {
    let h = scripted_harness(ScriptedDump::default());

    assert!(h.services.backup.backup(BackupRequest::manual(Some("alice".into()))).await.unwrap());
    assert!(h.services.backup.backup(BackupRequest::manual(Some("bob".into()))).await.unwrap());

    // an anomalous reading in the same second is associated, not re-dumped
    let reading = insert(&h, nominal());
    let force = ForceFlags {
        anomaly: true,
        abnormal_forecast: false,
    };
    let outcome = h.services.scoring.score(reading.id, force).await.unwrap();
    assert!(outcome.backup_performed);
    assert!(outcome.reading.backup_triggered);

    let records = h.services.backup.list_backups().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].trigger_reason, TriggerReason::Manual);
    assert_eq!(records[0].created_by.as_deref(), Some("alice"));
    assert!(records[0].triggered_by.contains(&reading.id));
    assert_eq!(h.dump.calls(), 1);

    // one second later is a new artifact
    h.clock.advance(Duration::seconds(1));
    assert!(h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    assert_eq!(h.services.backup.list_backups().unwrap().len(), 2);
    assert_eq!(h.dump.calls(), 2);
}

#[tokio::test]
async fn unknown_reading_is_an_error() {
    let h = scripted_harness(ScriptedDump::default());
    let err = h
        .services
        .backup
        .backup(BackupRequest::for_reading(42))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::UnknownReading(42)));
}

// ============================================================================
// Failure and retry
// ============================================================================

#[tokio::test]
async fn failed_dump_is_recorded_then_retried_in_place() {
    let h = scripted_harness(ScriptedDump::failing(1));

    assert!(!h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    let records = h.services.backup.list_backups().unwrap();
    assert_eq!(records.len(), 1);
    let failed = &records[0];
    assert_eq!(failed.status, BackupStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(failed.error_message.as_deref().unwrap().contains("Connection refused"));
    // partial output is not left behind
    assert!(!h.services.backup.backup_dir().join(&failed.artifact_name).exists());

    // same second, same name: the record is updated, not duplicated
    assert!(h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    let records = h.services.backup.list_backups().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, failed.id);
    assert_eq!(records[0].status, BackupStatus::Success);
    assert_eq!(records[0].attempts, 2);
    assert!(records[0].error_message.is_none());
    assert!(h.services.backup.backup_dir().join(&records[0].artifact_name).exists());

    let summary = h.services.backup.summary().unwrap();
    assert_eq!((summary.total, summary.successful, summary.failed), (1, 1, 0));
}

#[tokio::test]
async fn storage_error_during_dump_leaves_no_record() {
    let h = scripted_harness(ScriptedDump::storage_failing(1));

    let err = h.services.backup.backup(BackupRequest::manual(None)).await.unwrap_err();
    assert!(matches!(err, BackupError::Store(_)));
    assert!(err.is_transient());
    assert!(h.services.backup.list_backups().unwrap().is_empty());
    let dir = h.services.backup.backup_dir();
    assert_eq!(fs::read_dir(dir).unwrap().count(), 0);

    // the next attempt in the same second dumps normally
    assert!(h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    assert_eq!(h.services.backup.list_backups().unwrap()[0].attempts, 1);
}

#[tokio::test]
async fn error_message_is_truncated() {
    let h = scripted_harness_with(ScriptedDump::failing(1), |c| c.backup.max_error_len = 12);
    assert!(!h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    let record = &h.services.backup.list_backups().unwrap()[0];
    assert_eq!(record.error_message.as_deref().unwrap().chars().count(), 12);
}

// ============================================================================
// Scheduled backups
// ============================================================================

#[tokio::test]
async fn scheduled_backup_with_no_readings() {
    let h = scripted_harness(ScriptedDump::default());
    assert_eq!(h.services.store.reading_count(), 0);

    let outcome = h.services.run_job(JobKind::Backup).await.unwrap();
    assert_eq!(outcome, JobOutcome::BackedUp(true));

    let records = h.services.backup.list_backups().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].trigger_reason, TriggerReason::Scheduled);
    assert!(records[0].triggered_by.is_empty());
}

#[tokio::test]
async fn busy_runner_skips_job() {
    let h = scripted_harness(ScriptedDump::default());
    let guard = h.services.runner.try_acquire(JobKind::Maintenance).unwrap();

    let outcome = h.services.run_job(JobKind::Backup).await.unwrap();
    assert_eq!(outcome, JobOutcome::Skipped);
    assert_eq!(h.dump.calls(), 0);

    drop(guard);
    assert_eq!(h.services.run_job(JobKind::Backup).await.unwrap(), JobOutcome::BackedUp(true));
}

// ============================================================================
// Restore
// ============================================================================

#[tokio::test]
async fn restore_roundtrip() {
    let h = native_harness();
    for _ in 0..3 {
        insert(&h, nominal());
        h.clock.advance(Duration::seconds(5));
    }
    let scored = h.services.scoring.score(2, ForceFlags::default()).await.unwrap();
    assert!(h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    let artifact = h.services.backup.list_backups().unwrap()[0].artifact_name.clone();

    // mutate after the snapshot
    h.services.store.delete_readings(&[1]).unwrap();
    insert(&h, nominal());
    insert(&h, nominal());
    assert_eq!(h.services.store.reading_sequence().unwrap(), 5);

    let summary = h.services.backup.restore(&artifact, Some("operator")).await.unwrap();
    assert_eq!(summary.rows_restored, 3);
    assert!(summary.schema_found);
    assert_eq!(summary.sequence, 3);

    let ids: Vec<u64> = h.services.store.list_readings().unwrap().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    let restored = h.services.store.require_reading(2).unwrap();
    assert_eq!(restored.scoring, scored.reading.scoring);

    // the sequence continues past the restored ids
    assert_eq!(insert(&h, nominal()).id, 4);
}

#[tokio::test]
async fn restore_rejects_bad_names_and_bad_artifacts() {
    let h = native_harness();
    insert(&h, nominal());

    let err = h.services.backup.restore("../secrets.sql", None).await.unwrap_err();
    assert!(matches!(err, BackupError::InvalidArtifactName(_)));

    let err = h.services.backup.restore("energy_data_20990101_000000.sql", None).await.unwrap_err();
    assert!(matches!(err, BackupError::ArtifactNotFound(_)));

    let dir = h.services.backup.backup_dir().to_path_buf();
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("energy_data_20250101_000000.sql"), "-- empty dump\n").unwrap();
    let err = h
        .services
        .backup
        .restore("energy_data_20250101_000000.sql", None)
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Artifact { .. }));

    // nothing was replaced
    assert_eq!(h.services.store.reading_count(), 1);
}

#[tokio::test]
async fn export_only_artifacts_are_not_restored() {
    let h = scripted_harness(ScriptedDump::export_only());
    insert(&h, nominal());
    assert!(h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    let record = h.services.backup.list_backups().unwrap().remove(0);
    assert!(record.export_only);

    let err = h
        .services
        .backup
        .restore(&record.artifact_name, Some("operator"))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::ExportOnly(ref name) if *name == record.artifact_name));
    assert_eq!(h.services.store.reading_count(), 1);
}

#[tokio::test]
async fn delete_artifact_removes_file_and_record() {
    let h = scripted_harness(ScriptedDump::default());
    assert!(h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    let name = h.services.backup.list_backups().unwrap()[0].artifact_name.clone();

    h.services.backup.delete_artifact(&name).await.unwrap();
    assert!(h.services.backup.list_backups().unwrap().is_empty());
    assert!(!h.services.backup.backup_dir().join(&name).exists());

    let err = h.services.backup.delete_artifact(&name).await.unwrap_err();
    assert!(matches!(err, BackupError::ArtifactNotFound(_)));
}

// ============================================================================
// Cleanup and retention
// ============================================================================

fn write_artifact(dir: &std::path::Path, name: &str, age: Duration) {
    let path = dir.join(name);
    fs::write(&path, "-- artifact\n").unwrap();
    let modified = SystemTime::from(Utc::now() - age);
    fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
}

#[tokio::test]
async fn cleanup_keeps_newest_within_count() {
    let h = scripted_harness(ScriptedDump::default());
    h.clock.set(Utc::now());
    let dir = h.services.backup.backup_dir().to_path_buf();
    fs::create_dir_all(&dir).unwrap();

    for i in 0..5 {
        write_artifact(&dir, &format!("energy_data_2025030{i}_000000.sql"), Duration::hours(5 - i));
    }
    write_artifact(&dir, "energy_data_20250101_000000.sql", Duration::days(40));
    fs::write(dir.join("notes.txt"), "keep me").unwrap();

    let report = h.services.backup.cleanup(30, 3).await.unwrap();
    assert_eq!(report.expired, vec!["energy_data_20250101_000000.sql".to_string()]);
    assert_eq!(report.over_limit.len(), 2);

    let mut remaining: Vec<String> = fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    remaining.sort();
    assert_eq!(
        remaining,
        vec![
            "energy_data_20250302_000000.sql",
            "energy_data_20250303_000000.sql",
            "energy_data_20250304_000000.sql",
            "notes.txt",
        ]
    );
}

#[tokio::test]
async fn cleanup_drops_orphaned_success_records() {
    let h = scripted_harness(ScriptedDump::default());
    assert!(h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    let name = h.services.backup.list_backups().unwrap()[0].artifact_name.clone();
    fs::remove_file(h.services.backup.backup_dir().join(&name)).unwrap();

    let report = h.services.backup.cleanup(30, 20).await.unwrap();
    assert_eq!(report.orphaned_records, vec![name]);
    assert!(h.services.backup.list_backups().unwrap().is_empty());
}

#[tokio::test]
async fn oversized_retention_settings_do_not_break_backups() {
    let h = scripted_harness(ScriptedDump::default());
    h.services
        .settings
        .update(
            |s| {
                s.backup_retention_days = 100_000_000;
                s.backup_frequency_hours = 10_000_000_000;
            },
            Some("operator"),
            h.clock.now(),
        )
        .unwrap();

    assert!(h.services.backup.backup(BackupRequest::manual(None)).await.unwrap());
    assert!(matches!(
        h.services.run_job(JobKind::Maintenance).await.unwrap(),
        JobOutcome::Maintained(_)
    ));

    // a window reaching before the earliest representable time expires nothing
    let report = h.services.backup.cleanup(u32::MAX, 20).await.unwrap();
    assert!(report.expired.is_empty());
    assert_eq!(h.services.backup.list_backups().unwrap().len(), 1);
}

#[tokio::test]
async fn purge_keeps_most_recent_readings() {
    let h = scripted_harness(ScriptedDump::default());
    for _ in 0..10 {
        insert(&h, nominal());
        h.clock.advance(Duration::minutes(1));
    }
    // identical timestamps are ordered by id
    for _ in 0..2 {
        insert(&h, nominal());
    }

    assert_eq!(h.services.retention.purge_excess_readings(4).unwrap(), 8);
    let ids: Vec<u64> = h.services.store.list_readings().unwrap().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![9, 10, 11, 12]);
    assert_eq!(h.services.retention.purge_excess_readings(4).unwrap(), 0);
}

#[tokio::test]
async fn maintenance_job_applies_current_settings() {
    let h = scripted_harness(ScriptedDump::default());
    for _ in 0..6 {
        insert(&h, nominal());
        h.clock.advance(Duration::seconds(1));
    }
    h.services
        .settings
        .update(|s| s.max_readings = 2, Some("operator"), h.clock.now())
        .unwrap();

    let JobOutcome::Maintained(report) = h.services.run_job(JobKind::Maintenance).await.unwrap() else {
        panic!("maintenance did not run");
    };
    assert_eq!(report.retention.readings_deleted, 4);
    assert!(!report.log_rotated);
    assert_eq!(h.services.store.reading_count(), 2);
}
