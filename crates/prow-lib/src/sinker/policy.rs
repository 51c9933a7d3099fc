//! Garbage collection decisions
//!
//! [`plan_cleanup`] is a pure function of the listed resources, the owner
//! lookups the controller already performed, and the clock.

use crate::config::SinkerConfig;
use crate::models::{Pod, ProwJob};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Pods younger than this are never treated as orphans
///
/// Covers the lag between a ProwJob's creation and its appearance in list
/// results.
pub const ORPHAN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProwJobCleanReason {
    Aged,
    AgedPeriodic,
}

impl ProwJobCleanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProwJobCleanReason::Aged => "aged",
            ProwJobCleanReason::AgedPeriodic => "aged-periodic",
        }
    }
}

impl fmt::Display for ProwJobCleanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PodCleanReason {
    /// Started longer ago than the maximum pod age
    Aged,
    /// Owner or containers finished longer ago than the TTL
    Ttled,
    /// Owning ProwJob no longer exists
    Orphaned,
}

impl PodCleanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodCleanReason::Aged => "aged",
            PodCleanReason::Ttled => "ttled",
            PodCleanReason::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for PodCleanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProwJobDeletion {
    pub namespace: String,
    pub name: String,
    pub job: String,
    pub reason: ProwJobCleanReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PodDeletion {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub reason: PodCleanReason,
    /// Finalizers that will make the delete call fail
    pub finalizers: Vec<String>,
}

/// Everything one pass intends to delete
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanPlan {
    pub prow_jobs: Vec<ProwJobDeletion>,
    /// Pod deletions keyed by cluster
    pub pods: BTreeMap<String, Vec<PodDeletion>>,
}

impl CleanPlan {
    pub fn pod_count(&self) -> usize {
        self.pods.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.prow_jobs.is_empty() && self.pod_count() == 0
    }
}

/// Resolution of pod owners by name
///
/// Starts from the listed ProwJobs; direct lookups refine it. A name that
/// was neither listed nor looked up is unknown, which is never the same as
/// missing.
#[derive(Debug, Clone, Default)]
pub struct OwnerIndex {
    jobs: HashMap<String, ProwJob>,
    missing: HashSet<String>,
}

impl OwnerIndex {
    pub fn from_listed(jobs: &[ProwJob]) -> Self {
        Self {
            jobs: jobs.iter().map(|j| (j.name.clone(), j.clone())).collect(),
            missing: HashSet::new(),
        }
    }

    /// Record a job fetched directly; replaces any listed copy
    pub fn record_found(&mut self, job: ProwJob) {
        self.missing.remove(&job.name);
        self.jobs.insert(job.name.clone(), job);
    }

    /// Record that a direct lookup returned NotFound
    pub fn record_missing(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.jobs.remove(&name);
        self.missing.insert(name);
    }

    pub fn get(&self, name: &str) -> Option<&ProwJob> {
        self.jobs.get(name)
    }

    pub fn is_missing(&self, name: &str) -> bool {
        self.missing.contains(name)
    }
}

/// `true` when strictly more than `period` has passed since `since`
fn older_than(now: DateTime<Utc>, since: DateTime<Utc>, period: Duration) -> bool {
    (now - since).to_std().is_ok_and(|elapsed| elapsed > period)
}

/// Name of the newest completed run of each periodic job
///
/// Ties on completion time go to the greater ProwJob name.
pub fn newest_completed_periodics(jobs: &[ProwJob]) -> HashMap<&str, &str> {
    let mut newest: HashMap<&str, &ProwJob> = HashMap::new();
    for job in jobs.iter().filter(|j| j.is_periodic() && j.complete()) {
        newest
            .entry(job.job_name())
            .and_modify(|current| {
                let candidate = (job.status.completion_time, job.name.as_str());
                if candidate > (current.status.completion_time, current.name.as_str()) {
                    *current = job;
                }
            })
            .or_insert(job);
    }
    newest
        .into_iter()
        .map(|(job_name, job)| (job_name, job.name.as_str()))
        .collect()
}

/// Completed ProwJobs past the maximum age, except the newest run of each periodic
pub fn prow_jobs_to_delete(
    now: DateTime<Utc>,
    config: &SinkerConfig,
    jobs: &[ProwJob],
) -> Vec<ProwJobDeletion> {
    let retained = newest_completed_periodics(jobs);

    jobs.iter()
        .filter_map(|job| {
            let completed = job.status.completion_time?;
            if !older_than(now, completed, config.max_prowjob_age) {
                return None;
            }
            let reason = if job.is_periodic() {
                if retained.get(job.job_name()) == Some(&job.name.as_str()) {
                    return None;
                }
                ProwJobCleanReason::AgedPeriodic
            } else {
                ProwJobCleanReason::Aged
            };
            Some(ProwJobDeletion {
                namespace: job.namespace.clone(),
                name: job.name.clone(),
                job: job.job_name().to_string(),
                reason,
            })
        })
        .collect()
}

/// Why `pod` should be deleted, if it should
pub fn pod_clean_reason(
    now: DateTime<Utc>,
    config: &SinkerConfig,
    pod: &Pod,
    owners: &OwnerIndex,
) -> Option<PodCleanReason> {
    if !pod.created_by_prow() {
        return None;
    }

    let ttl = config.terminated_pod_ttl;

    if pod.status.phase.is_terminal()
        && pod
            .status
            .all_terminated_at()
            .is_some_and(|finished| older_than(now, finished, ttl))
    {
        return Some(PodCleanReason::Ttled);
    }

    // Pods from before the id label carry their ProwJob's name
    let owner_name = pod
        .owner()
        .map(|o| o.prow_job_name.as_str())
        .or_else(|| owners.get(&pod.name).map(|_| pod.name.as_str()));

    if let Some(owner) = owner_name.and_then(|name| owners.get(name)) {
        return match owner.status.completion_time {
            Some(completed) if older_than(now, completed, ttl) => Some(PodCleanReason::Ttled),
            Some(_) => age_reason(now, config, pod),
            None => None,
        };
    }

    if owner_name.is_some_and(|name| owners.is_missing(name))
        && older_than(now, pod.creation_timestamp, ORPHAN_GRACE_PERIOD)
    {
        return Some(PodCleanReason::Orphaned);
    }

    age_reason(now, config, pod)
}

fn age_reason(now: DateTime<Utc>, config: &SinkerConfig, pod: &Pod) -> Option<PodCleanReason> {
    pod.status
        .start_time
        .is_some_and(|started| older_than(now, started, config.max_pod_age))
        .then_some(PodCleanReason::Aged)
}

/// Decide every deletion for one pass
///
/// Clusters listed in the exclusion set are skipped even if their pods were
/// passed in.
pub fn plan_cleanup(
    now: DateTime<Utc>,
    config: &SinkerConfig,
    prow_jobs: &[ProwJob],
    pods: &BTreeMap<String, Vec<Pod>>,
    owners: &OwnerIndex,
) -> CleanPlan {
    let mut plan = CleanPlan {
        prow_jobs: prow_jobs_to_delete(now, config, prow_jobs),
        pods: BTreeMap::new(),
    };

    for (cluster, cluster_pods) in pods {
        if config.is_excluded(cluster) {
            continue;
        }
        let deletions: Vec<PodDeletion> = cluster_pods
            .iter()
            .filter_map(|pod| {
                pod_clean_reason(now, config, pod, owners).map(|reason| PodDeletion {
                    cluster: cluster.clone(),
                    namespace: pod.namespace.clone(),
                    name: pod.name.clone(),
                    reason,
                    finalizers: pod.finalizers.clone(),
                })
            })
            .collect();
        if !deletions.is_empty() {
            plan.pods.insert(cluster.clone(), deletions);
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerStatus, PodPhase, PodStatus, ProwJobState, ProwJobType};
    use chrono::{Duration as ChronoDuration, TimeZone};

    const HOUR: i64 = 3600;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn ago(secs: i64) -> DateTime<Utc> {
        now() - ChronoDuration::seconds(secs)
    }

    fn config() -> SinkerConfig {
        SinkerConfig {
            max_prowjob_age: Duration::from_secs(48 * HOUR as u64),
            max_pod_age: Duration::from_secs(12 * HOUR as u64),
            terminated_pod_ttl: Duration::from_secs(2 * HOUR as u64),
            ..SinkerConfig::default()
        }
    }

    fn completed(name: &str, job_type: ProwJobType, job: &str, completed_ago: i64) -> ProwJob {
        let mut pj = ProwJob::new(name, "default", job_type, job, ago(completed_ago + 60));
        pj.finish(ProwJobState::Success, ago(completed_ago));
        pj
    }

    #[test]
    fn test_newest_completed_tie_breaks_by_name() {
        let jobs = vec![
            completed("b", ProwJobType::Periodic, "ci", 100),
            completed("c", ProwJobType::Periodic, "ci", 100),
            completed("a", ProwJobType::Periodic, "ci", 100),
        ];
        assert_eq!(newest_completed_periodics(&jobs)["ci"], "c");
    }

    #[test]
    fn test_incomplete_periodic_does_not_shield_older_run() {
        let running = ProwJob::new("run", "default", ProwJobType::Periodic, "ci", ago(10));
        let old = completed("old", ProwJobType::Periodic, "ci", 100 * HOUR);
        let older = completed("older", ProwJobType::Periodic, "ci", 200 * HOUR);

        let deleted = prow_jobs_to_delete(now(), &config(), &[running, old, older]);

        let names: Vec<_> = deleted.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["older"]);
        assert_eq!(deleted[0].reason, ProwJobCleanReason::AgedPeriodic);
    }

    #[test]
    fn test_age_boundary_is_strict() {
        let exact = completed("exact", ProwJobType::Presubmit, "unit", 48 * HOUR);
        let past = completed("past", ProwJobType::Presubmit, "unit", 48 * HOUR + 1);

        let deleted = prow_jobs_to_delete(now(), &config(), &[exact, past]);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "past");
        assert_eq!(deleted[0].reason, ProwJobCleanReason::Aged);
    }

    #[test]
    fn test_unlabelled_pod_is_ignored() {
        let mut pod = Pod::new("random", "test-pods", ago(100 * HOUR));
        pod.status.start_time = Some(ago(100 * HOUR));

        assert_eq!(
            pod_clean_reason(now(), &config(), &pod, &OwnerIndex::default()),
            None
        );
    }

    #[test]
    fn test_legacy_pod_matched_by_name() {
        let owner = completed("legacy", ProwJobType::Presubmit, "unit", 3 * HOUR);
        let pod = Pod::new("legacy", "test-pods", ago(4 * HOUR))
            .with_labels([(crate::models::CREATED_BY_PROW_LABEL, "true")]);

        let owners = OwnerIndex::from_listed(&[owner]);
        assert_eq!(
            pod_clean_reason(now(), &config(), &pod, &owners),
            Some(PodCleanReason::Ttled)
        );
    }

    #[test]
    fn test_running_owner_protects_old_pod() {
        let owner = ProwJob::new("long", "default", ProwJobType::Periodic, "soak", ago(20 * HOUR));
        let mut pod = Pod::new("long-pod", "test-pods", ago(20 * HOUR)).for_prow_job("long");
        pod.status = PodStatus {
            phase: PodPhase::Running,
            start_time: Some(ago(20 * HOUR)),
            container_statuses: vec![ContainerStatus::running("test", ago(20 * HOUR))],
        };

        let owners = OwnerIndex::from_listed(&[owner]);
        assert_eq!(pod_clean_reason(now(), &config(), &pod, &owners), None);
    }

    #[test]
    fn test_unknown_owner_falls_back_to_age() {
        let mut pod = Pod::new("p", "test-pods", ago(13 * HOUR)).for_prow_job("not-looked-up");
        pod.status.start_time = Some(ago(13 * HOUR));

        assert_eq!(
            pod_clean_reason(now(), &config(), &pod, &OwnerIndex::default()),
            Some(PodCleanReason::Aged)
        );

        pod.status.start_time = Some(ago(HOUR));
        assert_eq!(
            pod_clean_reason(now(), &config(), &pod, &OwnerIndex::default()),
            None
        );
    }

    #[test]
    fn test_direct_lookup_overrides_listing() {
        let stale = ProwJob::new("pj", "default", ProwJobType::Presubmit, "unit", ago(5 * HOUR));
        let mut owners = OwnerIndex::from_listed(&[stale]);
        owners.record_found(completed("pj", ProwJobType::Presubmit, "unit", 3 * HOUR));

        let pod = Pod::new("pod", "test-pods", ago(5 * HOUR)).for_prow_job("pj");
        assert_eq!(
            pod_clean_reason(now(), &config(), &pod, &owners),
            Some(PodCleanReason::Ttled)
        );

        owners.record_missing("pj");
        assert!(owners.get("pj").is_none());
        assert_eq!(
            pod_clean_reason(now(), &config(), &pod, &owners),
            Some(PodCleanReason::Orphaned)
        );
    }

    #[test]
    fn test_excluded_cluster_is_skipped() {
        let mut cfg = config();
        cfg.exclude_clusters.insert("trusted".into());

        let mut pod = Pod::new("p", "test-pods", ago(13 * HOUR)).for_prow_job("x");
        pod.status.start_time = Some(ago(13 * HOUR));
        let pods: BTreeMap<String, Vec<Pod>> = [
            ("trusted".to_string(), vec![pod.clone()]),
            ("default".to_string(), vec![pod]),
        ]
        .into();

        let plan = plan_cleanup(now(), &cfg, &[], &pods, &OwnerIndex::default());
        assert_eq!(plan.pods.keys().collect::<Vec<_>>(), vec!["default"]);
        assert_eq!(plan.pod_count(), 1);
    }
}
