//! Trigger decisions for periodic jobs
//!
//! Pure functions over the current job listing; nothing here touches a store.

use crate::models::{Periodic, ProwJob, Trigger};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Why a periodic is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// No previous run exists
    FirstRun,
    /// Cron expression fired and the previous run is done
    Cron,
    /// Interval since the previous start elapsed
    Interval,
    /// Minimum interval since the previous completion elapsed
    MinimumInterval,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::FirstRun => "first-run",
            TriggerReason::Cron => "cron",
            TriggerReason::Interval => "interval",
            TriggerReason::MinimumInterval => "minimum-interval",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A periodic that should get a new run this pass
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTrigger {
    pub periodic: Periodic,
    pub reason: TriggerReason,
}

/// Latest periodic run per job name, by start time
///
/// On equal start times the first job in listing order wins.
pub fn latest_periodic_runs(jobs: &[ProwJob]) -> HashMap<&str, &ProwJob> {
    let mut latest: HashMap<&str, &ProwJob> = HashMap::new();
    for job in jobs.iter().filter(|j| j.is_periodic()) {
        latest
            .entry(job.job_name())
            .and_modify(|current| {
                if job.status.start_time > current.status.start_time {
                    *current = job;
                }
            })
            .or_insert(job);
    }
    latest
}

/// `true` when strictly more than `period` has passed since `since`
fn elapsed_beyond(now: DateTime<Utc>, since: DateTime<Utc>, period: Duration) -> bool {
    (now - since).to_std().is_ok_and(|elapsed| elapsed > period)
}

/// Decide whether `periodic` should run now
pub fn should_trigger(
    now: DateTime<Utc>,
    periodic: &Periodic,
    latest: Option<&ProwJob>,
    cron_queued: &HashSet<String>,
) -> Option<TriggerReason> {
    let Some(previous) = latest else {
        return Some(TriggerReason::FirstRun);
    };

    // Never overlap runs of the same periodic
    if !previous.complete() {
        return None;
    }

    match &periodic.trigger {
        Trigger::Cron(_) => cron_queued
            .contains(&periodic.name)
            .then_some(TriggerReason::Cron),
        Trigger::Interval(period) => elapsed_beyond(now, previous.status.start_time, *period)
            .then_some(TriggerReason::Interval),
        Trigger::MinimumInterval(period) => previous
            .status
            .completion_time
            .is_some_and(|completed| elapsed_beyond(now, completed, *period))
            .then_some(TriggerReason::MinimumInterval),
    }
}

/// Every periodic due for a new run, in configuration order
pub fn periodics_to_trigger(
    now: DateTime<Utc>,
    periodics: &[Periodic],
    latest: &HashMap<&str, &ProwJob>,
    cron_queued: &HashSet<String>,
) -> Vec<PlannedTrigger> {
    periodics
        .iter()
        .filter_map(|periodic| {
            let previous = latest.get(periodic.name.as_str()).copied();
            should_trigger(now, periodic, previous, cron_queued).map(|reason| PlannedTrigger {
                periodic: periodic.clone(),
                reason,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProwJobState, ProwJobType};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn run(name: &str, job: &str, start: i64) -> ProwJob {
        ProwJob::new(name, "default", ProwJobType::Periodic, job, ts(start))
    }

    #[test]
    fn test_latest_run_by_start_time() {
        let jobs = vec![
            run("a", "ci", 100),
            run("b", "ci", 300),
            run("c", "ci", 200),
            run("d", "other", 50),
            ProwJob::new("e", "default", ProwJobType::Presubmit, "ci", ts(900)),
        ];

        let latest = latest_periodic_runs(&jobs);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["ci"].name, "b");
        assert_eq!(latest["other"].name, "d");
    }

    #[test]
    fn test_latest_run_tie_keeps_first_seen() {
        let jobs = vec![run("first", "ci", 100), run("second", "ci", 100)];
        assert_eq!(latest_periodic_runs(&jobs)["ci"].name, "first");
    }

    #[test]
    fn test_interval_is_strict() {
        let periodic = Periodic::new("ci", Trigger::Interval(Duration::from_secs(60)));
        let mut previous = run("a", "ci", 0);
        previous.finish(ProwJobState::Success, ts(10));
        let empty = HashSet::new();

        assert_eq!(should_trigger(ts(60), &periodic, Some(&previous), &empty), None);
        assert_eq!(
            should_trigger(ts(61), &periodic, Some(&previous), &empty),
            Some(TriggerReason::Interval)
        );
    }

    #[test]
    fn test_clock_skew_does_not_trigger() {
        let periodic = Periodic::new("ci", Trigger::Interval(Duration::from_secs(60)));
        let mut previous = run("a", "ci", 1000);
        previous.finish(ProwJobState::Success, ts(1010));

        assert_eq!(
            should_trigger(ts(500), &periodic, Some(&previous), &HashSet::new()),
            None
        );
    }

    #[test]
    fn test_cron_requires_queue_entry() {
        let periodic = Periodic::new("nightly", Trigger::Cron("0 0 3 * * *".into()));
        let mut previous = run("a", "nightly", 0);
        previous.finish(ProwJobState::Failure, ts(10));

        assert_eq!(
            should_trigger(ts(99_999), &periodic, Some(&previous), &HashSet::new()),
            None
        );
        let queued: HashSet<String> = ["nightly".to_string()].into();
        assert_eq!(
            should_trigger(ts(20), &periodic, Some(&previous), &queued),
            Some(TriggerReason::Cron)
        );
    }

    #[test]
    fn test_periodics_to_trigger_preserves_order() {
        let periodics = vec![
            Periodic::new("z", Trigger::Interval(Duration::from_secs(1))),
            Periodic::new("a", Trigger::Interval(Duration::from_secs(1))),
        ];
        let jobs: Vec<ProwJob> = Vec::new();
        let latest = latest_periodic_runs(&jobs);

        let planned = periodics_to_trigger(ts(0), &periodics, &latest, &HashSet::new());
        let names: Vec<_> = planned.iter().map(|p| p.periodic.name.as_str()).collect();
        assert_eq!(names, vec!["z", "a"]);
        assert!(planned.iter().all(|p| p.reason == TriggerReason::FirstRun));
    }
}
