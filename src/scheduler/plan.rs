//! Pure fire-time planning for the scheduler's jobs.
//!
//! Nothing here reads a clock: callers pass `now`, the anchor of each job
//! and the settings snapshot, which keeps re-planning after a settings
//! reload deterministic and testable.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use std::fmt;

use crate::types::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Generate, score and (if needed) back up one reading.
    Collect,
    /// Dataset-wide snapshot with reason `scheduled`.
    Backup,
    /// Retention for readings and backups, plus log rotation.
    Maintenance,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Collect, JobKind::Backup, JobKind::Maintenance];
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Collect => write!(f, "data-collection"),
            JobKind::Backup => write!(f, "scheduled-backup"),
            JobKind::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Next firing of an interval job last fired (or anchored) at `last`.
/// An overdue job fires at `now`; missed runs are not caught up. A sum past
/// the representable range saturates at [`DateTime::<Utc>::MAX_UTC`].
pub fn next_fire_time(last: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let next = last
        .checked_add_signed(interval)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if next <= now {
        now
    } else {
        next
    }
}

/// First occurrence of the wall-clock time `at` in `tz` strictly after `after`.
pub fn next_daily_fire<Tz: TimeZone>(at: NaiveTime, after: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let local_after = after.with_timezone(tz).naive_local();
    let mut day = local_after.date();
    loop {
        let candidate = day.and_time(at);
        // `None` for a wall time skipped by a DST change; try one hour later.
        let resolved = tz
            .from_local_datetime(&candidate)
            .earliest()
            .or_else(|| {
                let shifted = candidate.checked_add_signed(Duration::hours(1))?;
                tz.from_local_datetime(&shifted).earliest()
            })
            .map(|t| t.with_timezone(&Utc));
        if let Some(fire) = resolved.filter(|t| *t > after) {
            return fire;
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => {
                return after
                    .checked_add_signed(Duration::days(1))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobEntry {
    pub kind: JobKind,
    pub next_due: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Firing times of all jobs, derived from the settings of the last reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTable {
    started_at: DateTime<Utc>,
    entries: Vec<JobEntry>,
}

impl JobTable {
    /// Fresh table for a scheduler started at `started_at`.
    pub fn new<Tz: TimeZone>(settings: &Settings, started_at: DateTime<Utc>, now: DateTime<Utc>, tz: &Tz) -> Self {
        let mut table = Self {
            started_at,
            entries: JobKind::ALL
                .iter()
                .map(|&kind| JobEntry {
                    kind,
                    next_due: now,
                    last_run: None,
                })
                .collect(),
        };
        table.replan(settings, now, tz);
        table
    }

    fn next_due_for<Tz: TimeZone>(
        &self,
        entry: &JobEntry,
        settings: &Settings,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> DateTime<Utc> {
        let anchor = entry.last_run.unwrap_or(self.started_at);
        match entry.kind {
            JobKind::Collect => next_fire_time(anchor, settings.collection_interval(), now),
            JobKind::Backup => next_fire_time(anchor, settings.backup_interval(), now),
            JobKind::Maintenance => next_daily_fire(settings.maintenance_time, anchor, tz),
        }
    }

    /// Recompute every firing time from `settings`, keeping run history.
    pub fn replan<Tz: TimeZone>(&mut self, settings: &Settings, now: DateTime<Utc>, tz: &Tz) {
        let planned: Vec<DateTime<Utc>> = self
            .entries
            .iter()
            .map(|entry| self.next_due_for(entry, settings, now, tz))
            .collect();
        for (entry, next_due) in self.entries.iter_mut().zip(planned) {
            entry.next_due = next_due;
        }
    }

    /// Record that `kind` ran at `at` and plan its next firing.
    pub fn mark_ran<Tz: TimeZone>(&mut self, kind: JobKind, at: DateTime<Utc>, settings: &Settings, tz: &Tz) {
        let Some(idx) = self.entries.iter().position(|e| e.kind == kind) else {
            return;
        };
        self.entries[idx].last_run = Some(at);
        let next_due = self.next_due_for(&self.entries[idx], settings, at, tz);
        self.entries[idx].next_due = next_due;
    }

    /// Jobs due at `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<JobKind> {
        let mut due: Vec<&JobEntry> = self.entries.iter().filter(|e| e.next_due <= now).collect();
        due.sort_by_key(|e| e.next_due);
        due.into_iter().map(|e| e.kind).collect()
    }

    pub fn entry(&self, kind: JobKind) -> Option<&JobEntry> {
        self.entries.iter().find(|e| e.kind == kind)
    }

    /// Earliest upcoming firing.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|e| e.next_due).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_next_fire_time() {
        let interval = Duration::minutes(15);
        assert_eq!(next_fire_time(at(10, 0), interval, at(10, 5)), at(10, 15));
        // overdue fires now, no catch-up
        assert_eq!(next_fire_time(at(10, 0), interval, at(11, 2)), at(11, 2));
    }

    #[test]
    fn test_next_daily_fire() {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        assert_eq!(
            next_daily_fire(midnight, at(10, 0), &Utc),
            Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap()
        );
        let half_past = NaiveTime::from_hms_opt(10, 30, 0).unwrap();
        assert_eq!(next_daily_fire(half_past, at(10, 0), &Utc), at(10, 30));
        // strictly after
        assert_eq!(
            next_daily_fire(half_past, at(10, 30), &Utc),
            Utc.with_ymd_and_hms(2025, 3, 2, 10, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_table_plans_from_settings() {
        let settings = Settings::default();
        let table = JobTable::new(&settings, at(10, 0), at(10, 0), &Utc);
        assert_eq!(table.entry(JobKind::Collect).unwrap().next_due, at(10, 15));
        assert_eq!(table.entry(JobKind::Backup).unwrap().next_due, at(10, 0) + Duration::hours(24));
        assert_eq!(
            table.entry(JobKind::Maintenance).unwrap().next_due,
            Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap()
        );
        assert!(table.due(at(10, 14)).is_empty());
        assert_eq!(table.due(at(10, 15)), vec![JobKind::Collect]);
        assert_eq!(table.next_due(), Some(at(10, 15)));
    }

    #[test]
    fn test_replan_uses_new_settings_and_history() {
        let mut settings = Settings::default();
        let mut table = JobTable::new(&settings, at(10, 0), at(10, 0), &Utc);
        table.mark_ran(JobKind::Collect, at(10, 15), &settings, &Utc);
        assert_eq!(table.entry(JobKind::Collect).unwrap().next_due, at(10, 30));

        settings.data_collection_interval_minutes = 5;
        table.replan(&settings, at(10, 16), &Utc);
        assert_eq!(table.entry(JobKind::Collect).unwrap().next_due, at(10, 20));

        // non-positive interval falls back to the default
        settings.data_collection_interval_minutes = 0;
        table.replan(&settings, at(10, 16), &Utc);
        assert_eq!(table.entry(JobKind::Collect).unwrap().next_due, at(10, 30));
    }

    #[test]
    fn test_huge_intervals_do_not_overflow() {
        assert_eq!(
            next_fire_time(DateTime::<Utc>::MAX_UTC, Duration::days(1), at(10, 0)),
            DateTime::<Utc>::MAX_UTC
        );

        let settings = Settings {
            backup_frequency_hours: 10_000_000_000,
            data_collection_interval_minutes: i64::MAX,
            ..Settings::default()
        };
        let mut table = JobTable::new(&settings, at(10, 0), at(10, 0), &Utc);
        table.mark_ran(JobKind::Backup, at(11, 0), &settings, &Utc);
        let backup = table.entry(JobKind::Backup).unwrap().next_due;
        assert_eq!(backup, at(11, 0) + Duration::hours(24 * 366));
        assert!(table.due(at(12, 0)).is_empty());
    }

    #[test]
    fn test_due_orders_earliest_first() {
        let mut settings = Settings::default();
        settings.backup_frequency_hours = 1;
        let table = JobTable::new(&settings, at(10, 0), at(10, 0), &Utc);
        assert_eq!(
            table.due(at(12, 0)),
            vec![JobKind::Collect, JobKind::Backup]
        );
    }
}
