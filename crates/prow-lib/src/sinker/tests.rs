//! Scenario tests for the garbage collector

use super::*;
use crate::config::{ConfigAgent, ProwConfig, SinkerConfig};
use crate::models::{
    ContainerStatus, Pod, PodPhase, PodStatus, ProwJob, ProwJobState, ProwJobType,
};
use crate::store::{MemoryStore, PodStore, PodStores, ResourceStore};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

const HOUR: i64 = 3600;
const PJ_NS: &str = "prow";
const POD_NS: &str = "test-pods";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
}

fn ago(secs: i64) -> DateTime<Utc> {
    now() - ChronoDuration::seconds(secs)
}

fn prow_config() -> ProwConfig {
    ProwConfig {
        prowjob_namespace: PJ_NS.to_string(),
        pod_namespace: POD_NS.to_string(),
        sinker: SinkerConfig {
            max_prowjob_age: Duration::from_secs(24 * HOUR as u64),
            max_pod_age: Duration::from_secs(12 * HOUR as u64),
            terminated_pod_ttl: Duration::from_secs(HOUR as u64),
            ..SinkerConfig::default()
        },
        ..ProwConfig::default()
    }
}

fn job(name: &str, job_type: ProwJobType, job: &str, started_ago: i64) -> ProwJob {
    ProwJob::new(name, PJ_NS, job_type, job, ago(started_ago))
}

fn done(mut pj: ProwJob, completed_ago: i64) -> ProwJob {
    pj.finish(ProwJobState::Success, ago(completed_ago));
    pj
}

fn pod(name: &str, owner: &str, created_ago: i64) -> Pod {
    let mut pod = Pod::new(name, POD_NS, ago(created_ago)).for_prow_job(owner);
    pod.status.start_time = Some(ago(created_ago));
    pod.status.phase = PodPhase::Running;
    pod
}

fn finished_pod(name: &str, owner: &str, created_ago: i64, finished_ago: i64) -> Pod {
    pod(name, owner, created_ago).with_status(PodStatus {
        phase: PodPhase::Succeeded,
        start_time: Some(ago(created_ago)),
        container_statuses: vec![ContainerStatus::terminated("test", 0, ago(finished_ago))],
    })
}

struct Cluster {
    name: &'static str,
    store: Arc<MemoryStore<Pod>>,
}

fn cluster(name: &'static str, pods: Vec<Pod>) -> Cluster {
    Cluster {
        name,
        store: Arc::new(MemoryStore::with_items(pods)),
    }
}

fn sinker(
    config: ProwConfig,
    prow_jobs: &Arc<MemoryStore<ProwJob>>,
    clusters: &[&Cluster],
) -> Sinker {
    let pods: PodStores = clusters
        .iter()
        .map(|c| (c.name.to_string(), c.store.clone() as PodStore))
        .collect();
    Sinker::new(
        prow_jobs.clone(),
        pods,
        Arc::new(ConfigAgent::from_config(config)),
    )
}

#[tokio::test]
async fn test_old_completed_jobs_are_deleted() {
    let jobs = Arc::new(MemoryStore::with_items([
        done(job("old-pre", ProwJobType::Presubmit, "unit", 30 * HOUR), 25 * HOUR),
        done(job("new-pre", ProwJobType::Presubmit, "unit", 3 * HOUR), 2 * HOUR),
        job("running", ProwJobType::Postsubmit, "deploy", 40 * HOUR),
    ]));

    let report = sinker(prow_config(), &jobs, &[])
        .clean_at(now())
        .await
        .unwrap();

    assert!(!jobs.contains(PJ_NS, "old-pre"));
    assert!(jobs.contains(PJ_NS, "new-pre"));
    assert!(jobs.contains(PJ_NS, "running"));
    assert_eq!(report.prow_jobs_existing, 3);
    assert_eq!(report.prow_jobs_cleaned.get("aged"), Some(&1));
}

#[tokio::test]
async fn test_newest_periodic_run_is_retained() {
    let jobs = Arc::new(MemoryStore::with_items([
        done(job("p1", ProwJobType::Periodic, "nightly", 80 * HOUR), 79 * HOUR),
        done(job("p2", ProwJobType::Periodic, "nightly", 60 * HOUR), 55 * HOUR),
        done(job("p3", ProwJobType::Periodic, "nightly", 40 * HOUR), 30 * HOUR),
        done(job("q1", ProwJobType::Periodic, "weekly", 200 * HOUR), 199 * HOUR),
    ]));

    let report = sinker(prow_config(), &jobs, &[])
        .clean_at(now())
        .await
        .unwrap();

    let left: Vec<String> = jobs.items().into_iter().map(|j| j.name).collect();
    assert_eq!(left, vec!["p3".to_string(), "q1".to_string()]);
    assert_eq!(report.prow_jobs_cleaned.get("aged-periodic"), Some(&2));
}

#[tokio::test]
async fn test_terminated_pod_ttl_precedes_max_age() {
    let jobs = Arc::new(MemoryStore::with_items([job(
        "owner",
        ProwJobType::Presubmit,
        "unit",
        3 * HOUR,
    )]));
    // Three hours old (younger than max pod age), containers done two hours ago
    let build = cluster(
        "default",
        vec![finished_pod("owner-pod", "owner", 3 * HOUR, 2 * HOUR)],
    );

    let report = sinker(prow_config(), &jobs, &[&build])
        .clean_at(now())
        .await
        .unwrap();

    assert!(!build.store.contains(POD_NS, "owner-pod"));
    assert_eq!(report.pods_removed["default"].get("ttled"), Some(&1));
}

#[tokio::test]
async fn test_pending_pod_of_ttled_job_is_deleted() {
    let jobs = Arc::new(MemoryStore::with_items([done(
        job("owner", ProwJobType::Presubmit, "unit", 4 * HOUR),
        2 * HOUR,
    )]));
    let mut stuck = pod("stuck", "owner", 4 * HOUR);
    stuck.status.phase = PodPhase::Pending;
    let build = cluster("default", vec![stuck]);

    sinker(prow_config(), &jobs, &[&build])
        .clean_at(now())
        .await
        .unwrap();

    assert!(!build.store.contains(POD_NS, "stuck"));
}

#[tokio::test]
async fn test_finalizers_block_deletion_and_count_as_errors() {
    let jobs = Arc::new(MemoryStore::with_items([done(
        job("owner", ProwJobType::Presubmit, "unit", 4 * HOUR),
        3 * HOUR,
    )]));
    let held = finished_pod("held", "owner", 4 * HOUR, 3 * HOUR)
        .with_finalizers(["prow.x-k8s.io/gcsk8sreporter"]);
    let build = cluster("default", vec![held]);

    let s = sinker(prow_config(), &jobs, &[&build]);
    let plan = s.plan_at(now()).await.unwrap();
    assert_eq!(plan.pods["default"][0].finalizers.len(), 1);

    let report = s.clean_at(now()).await.unwrap();

    assert!(build.store.contains(POD_NS, "held"));
    assert_eq!(build.store.delete_calls(), 1);
    assert_eq!(
        report.pod_removal_errors["default"].get("FinalizersPresent"),
        Some(&1)
    );
    assert!(report.error_summary().unwrap().contains("FinalizersPresent"));
}

#[tokio::test]
async fn test_orphan_grace_window() {
    let jobs: Arc<MemoryStore<ProwJob>> = Arc::new(MemoryStore::new());
    let build = cluster(
        "default",
        vec![
            pod("fresh-orphan", "gone", 0),
            pod("edge-orphan", "gone", 30),
            pod("old-orphan", "gone", 31),
        ],
    );

    let report = sinker(prow_config(), &jobs, &[&build])
        .clean_at(now())
        .await
        .unwrap();

    assert!(build.store.contains(POD_NS, "fresh-orphan"));
    assert!(build.store.contains(POD_NS, "edge-orphan"));
    assert!(!build.store.contains(POD_NS, "old-orphan"));
    assert_eq!(report.pods_removed["default"].get("orphaned"), Some(&1));
}

#[tokio::test]
async fn test_owner_created_after_listing_is_not_orphaned() {
    // The owner is visible to direct gets but the listing is stale
    struct StaleListing(MemoryStore<ProwJob>);

    #[async_trait::async_trait]
    impl ResourceStore<ProwJob> for StaleListing {
        async fn list(&self, _: &str) -> Result<Vec<ProwJob>, crate::store::StoreError> {
            Ok(Vec::new())
        }
        async fn get(&self, ns: &str, name: &str) -> Result<ProwJob, crate::store::StoreError> {
            self.0.get(ns, name).await
        }
        async fn create(&self, item: ProwJob) -> Result<ProwJob, crate::store::StoreError> {
            self.0.create(item).await
        }
        async fn delete(&self, ns: &str, name: &str) -> Result<(), crate::store::StoreError> {
            self.0.delete(ns, name).await
        }
    }

    let stale = Arc::new(StaleListing(MemoryStore::with_items([job(
        "live",
        ProwJobType::Presubmit,
        "unit",
        120,
    )])));
    let build = cluster("default", vec![pod("live-pod", "live", 120)]);
    let pods: PodStores = [("default".to_string(), build.store.clone() as PodStore)].into();
    let s = Sinker::new(
        stale,
        pods,
        Arc::new(ConfigAgent::from_config(prow_config())),
    );

    let report = s.clean_at(now()).await.unwrap();

    assert!(build.store.contains(POD_NS, "live-pod"));
    assert_eq!(report.total_pods_removed(), 0);
}

#[tokio::test]
async fn test_owner_lookups_are_bounded() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct SlowGets {
        jobs: MemoryStore<ProwJob>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ResourceStore<ProwJob> for SlowGets {
        async fn list(&self, ns: &str) -> Result<Vec<ProwJob>, crate::store::StoreError> {
            self.jobs.list(ns).await
        }
        async fn get(&self, ns: &str, name: &str) -> Result<ProwJob, crate::store::StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.jobs.get(ns, name).await
        }
        async fn create(&self, item: ProwJob) -> Result<ProwJob, crate::store::StoreError> {
            self.jobs.create(item).await
        }
        async fn delete(&self, ns: &str, name: &str) -> Result<(), crate::store::StoreError> {
            self.jobs.delete(ns, name).await
        }
    }

    let pods: Vec<Pod> = (0..100)
        .map(|i| pod(&format!("pod-{}", i), &format!("gone-{}", i), HOUR))
        .collect();
    let build = cluster("default", pods);
    let store = Arc::new(SlowGets::default());
    let s = Sinker::new(
        store.clone(),
        [("default".to_string(), build.store.clone() as PodStore)].into(),
        Arc::new(ConfigAgent::from_config(prow_config())),
    );

    let report = s.clean_at(now()).await.unwrap();

    let peak = store.peak.load(Ordering::SeqCst);
    assert!(peak > 1);
    assert!(peak <= MAX_CONCURRENT_OWNER_LOOKUPS);
    assert_eq!(report.pods_removed["default"].get("orphaned"), Some(&100));
    assert!(build.store.is_empty());
}

#[tokio::test]
async fn test_unreachable_cluster_is_isolated() {
    let jobs = Arc::new(MemoryStore::with_items([done(
        job("owner", ProwJobType::Presubmit, "unit", 4 * HOUR),
        3 * HOUR,
    )]));
    let broken = cluster("broken", vec![pod("b-pod", "owner", 4 * HOUR)]);
    broken.store.fail_all("connection refused");
    let healthy = cluster("healthy", vec![pod("h-pod", "owner", 4 * HOUR)]);

    let s = sinker(prow_config(), &jobs, &[&broken, &healthy]);
    let report = s.clean_at(now()).await.unwrap();

    assert!(!healthy.store.contains(POD_NS, "h-pod"));
    assert_eq!(report.pods_removed["healthy"].get("ttled"), Some(&1));
    assert!(report.cluster_errors.contains_key("broken"));
    assert!(!report.pods_existing.contains_key("broken"));

    // The loop sees the failure, but only after the healthy cluster was cleaned
    healthy.store.insert(pod("h-pod-2", "owner", 4 * HOUR));
    let err = crate::controller_loop::Reconciler::reconcile(&s).await.unwrap_err();
    assert!(err.to_string().contains("broken"));
    assert!(!healthy.store.contains(POD_NS, "h-pod-2"));
}

#[tokio::test]
async fn test_excluded_cluster_is_never_listed() {
    let jobs: Arc<MemoryStore<ProwJob>> = Arc::new(MemoryStore::new());
    let trusted = cluster("trusted", vec![pod("t-pod", "gone", 20 * HOUR)]);
    trusted.store.fail_all("should not be called");

    let mut config = prow_config();
    config.sinker.exclude_clusters.insert("trusted".into());

    let report = sinker(config, &jobs, &[&trusted])
        .clean_at(now())
        .await
        .unwrap();

    assert!(report.cluster_errors.is_empty());
    assert_eq!(trusted.store.delete_calls(), 0);
}

#[tokio::test]
async fn test_delete_errors_do_not_stop_the_pass() {
    let jobs = Arc::new(MemoryStore::with_items([
        done(job("a", ProwJobType::Batch, "unit", 50 * HOUR), 40 * HOUR),
        done(job("b", ProwJobType::Batch, "unit", 50 * HOUR), 40 * HOUR),
    ]));
    jobs.fail_deletes_of("a");
    let build = cluster(
        "default",
        vec![pod("p1", "gone", 13 * HOUR), pod("p2", "gone", 13 * HOUR)],
    );
    build.store.fail_deletes_of("p1");

    let report = sinker(prow_config(), &jobs, &[&build])
        .clean_at(now())
        .await
        .unwrap();

    assert!(jobs.contains(PJ_NS, "a"));
    assert!(!jobs.contains(PJ_NS, "b"));
    assert!(build.store.contains(POD_NS, "p1"));
    assert!(!build.store.contains(POD_NS, "p2"));
    assert_eq!(report.prow_job_errors.get("InternalError"), Some(&1));
    assert_eq!(report.pod_removal_errors["default"].get("InternalError"), Some(&1));
    assert_eq!(report.total_errors(), 2);
}

#[tokio::test]
async fn test_already_deleted_counts_as_success() {
    struct Vanishing(MemoryStore<Pod>);

    #[async_trait::async_trait]
    impl ResourceStore<Pod> for Vanishing {
        async fn list(&self, ns: &str) -> Result<Vec<Pod>, crate::store::StoreError> {
            self.0.list(ns).await
        }
        async fn get(&self, ns: &str, name: &str) -> Result<Pod, crate::store::StoreError> {
            self.0.get(ns, name).await
        }
        async fn create(&self, item: Pod) -> Result<Pod, crate::store::StoreError> {
            self.0.create(item).await
        }
        async fn delete(&self, ns: &str, name: &str) -> Result<(), crate::store::StoreError> {
            // Someone else deleted it between list and delete
            self.0.remove(ns, name);
            self.0.delete(ns, name).await
        }
    }

    let jobs: Arc<MemoryStore<ProwJob>> = Arc::new(MemoryStore::new());
    let store = Arc::new(Vanishing(MemoryStore::with_items([pod("p", "gone", 60)])));
    let pods: PodStores = [("default".to_string(), store as PodStore)].into();
    let s = Sinker::new(
        jobs,
        pods,
        Arc::new(ConfigAgent::from_config(prow_config())),
    );

    let report = s.clean_at(now()).await.unwrap();

    assert_eq!(report.total_errors(), 0);
    assert_eq!(report.pods_removed["default"].get("orphaned"), Some(&1));
}

#[tokio::test]
async fn test_dry_run_deletes_nothing() {
    let jobs = Arc::new(MemoryStore::with_items([done(
        job("old", ProwJobType::Presubmit, "unit", 50 * HOUR),
        40 * HOUR,
    )]));
    let build = cluster("default", vec![pod("orphan", "gone", 13 * HOUR)]);

    let report = sinker(prow_config(), &jobs, &[&build])
        .with_dry_run(true)
        .clean_at(now())
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.total_prow_jobs_cleaned(), 1);
    assert_eq!(report.total_pods_removed(), 1);
    assert_eq!(jobs.delete_calls(), 0);
    assert_eq!(build.store.delete_calls(), 0);
    assert!(jobs.contains(PJ_NS, "old"));
}

#[tokio::test]
async fn test_prowjob_list_failure_aborts_pass() {
    let jobs: Arc<MemoryStore<ProwJob>> = Arc::new(MemoryStore::new());
    jobs.fail_all("apiserver down");
    let build = cluster("default", vec![pod("orphan", "gone", 13 * HOUR)]);

    let err = sinker(prow_config(), &jobs, &[&build])
        .clean_at(now())
        .await
        .unwrap_err();

    assert!(matches!(err, CleanError::ListProwJobs(_)));
    assert_eq!(build.store.delete_calls(), 0);
}

#[tokio::test]
async fn test_config_is_read_every_pass() {
    let jobs = Arc::new(MemoryStore::with_items([done(
        job("pj", ProwJobType::Presubmit, "unit", 10 * HOUR),
        9 * HOUR,
    )]));
    let agent = Arc::new(ConfigAgent::from_config(prow_config()));
    let s = Sinker::new(jobs.clone(), PodStores::new(), agent.clone());

    s.clean_at(now()).await.unwrap();
    assert!(jobs.contains(PJ_NS, "pj"));

    let mut tighter = prow_config();
    tighter.sinker.max_prowjob_age = Duration::from_secs(8 * HOUR as u64);
    agent.set(tighter);

    s.clean_at(now()).await.unwrap();
    assert!(!jobs.contains(PJ_NS, "pj"));
}
