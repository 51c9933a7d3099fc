use super::policy::{
    plan_cleanup, CleanPlan, OwnerIndex, PodDeletion, ProwJobDeletion, ORPHAN_GRACE_PERIOD,
};
use crate::config::{ConfigProvider, ProwConfig};
use crate::controller_loop::Reconciler;
use crate::health::components;
use crate::models::{Pod, ProwJob};
use crate::observability::{ControllerLogger, SinkerMetrics};
use crate::store::{PodStore, PodStores, ProwJobStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Upper bound on owner `get`s in flight during one pass
pub const MAX_CONCURRENT_OWNER_LOOKUPS: usize = 32;

#[derive(Debug, Error)]
pub enum CleanError {
    #[error("error listing prow jobs: {0}")]
    ListProwJobs(#[source] StoreError),
}

/// Counts from one garbage collection pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    pub dry_run: bool,
    pub prow_jobs_existing: usize,
    /// Prow pods listed per cluster
    pub pods_existing: BTreeMap<String, usize>,
    /// ProwJobs deleted per reason
    pub prow_jobs_cleaned: BTreeMap<String, usize>,
    /// Failed ProwJob deletions per error reason
    pub prow_job_errors: BTreeMap<String, usize>,
    /// Pods deleted per cluster, then reason
    pub pods_removed: BTreeMap<String, BTreeMap<String, usize>>,
    /// Failed pod deletions per cluster, then error reason
    pub pod_removal_errors: BTreeMap<String, BTreeMap<String, usize>>,
    /// Clusters whose pods could not be listed
    pub cluster_errors: BTreeMap<String, String>,
}

impl CleanReport {
    pub fn total_prow_jobs_cleaned(&self) -> usize {
        self.prow_jobs_cleaned.values().sum()
    }

    pub fn total_pods_removed(&self) -> usize {
        self.pods_removed.values().flat_map(|m| m.values()).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.prow_job_errors.values().sum::<usize>()
            + self
                .pod_removal_errors
                .values()
                .flat_map(|m| m.values())
                .sum::<usize>()
            + self.cluster_errors.len()
    }

    /// One-line description of every failure, if any occurred
    pub fn error_summary(&self) -> Option<String> {
        if self.total_errors() == 0 {
            return None;
        }

        let mut parts = Vec::new();
        for (reason, count) in &self.prow_job_errors {
            parts.push(format!("{} prowjob deletion(s) failed: {}", count, reason));
        }
        for (cluster, reasons) in &self.pod_removal_errors {
            for (reason, count) in reasons {
                parts.push(format!(
                    "{} pod deletion(s) failed in {}: {}",
                    count, cluster, reason
                ));
            }
        }
        for (cluster, message) in &self.cluster_errors {
            parts.push(format!("cluster {} unavailable: {}", cluster, message));
        }
        Some(parts.join("; "))
    }
}

/// Result of one deletion task
enum Outcome {
    ProwJobs {
        cleaned: BTreeMap<String, usize>,
        errors: BTreeMap<String, usize>,
    },
    Pods {
        cluster: String,
        removed: BTreeMap<String, usize>,
        errors: BTreeMap<String, usize>,
    },
}

/// Snapshot gathered before deciding anything
struct Observed {
    config: Arc<ProwConfig>,
    prow_jobs: Vec<ProwJob>,
    pods: BTreeMap<String, Vec<Pod>>,
    cluster_errors: BTreeMap<String, String>,
    owners: OwnerIndex,
}

/// Garbage collector for ProwJobs and their pods
pub struct Sinker {
    prow_jobs: ProwJobStore,
    pods: PodStores,
    config: Arc<dyn ConfigProvider>,
    dry_run: bool,
    metrics: SinkerMetrics,
    logger: ControllerLogger,
}

impl Sinker {
    pub fn new(prow_jobs: ProwJobStore, pods: PodStores, config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            prow_jobs,
            pods,
            config,
            dry_run: false,
            metrics: SinkerMetrics::new(),
            logger: ControllerLogger::new(components::SINKER),
        }
    }

    /// Log deletions without performing them
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Work out what a pass at `now` would delete
    pub async fn plan_at(&self, now: DateTime<Utc>) -> Result<CleanPlan, CleanError> {
        let observed = self.observe(now).await?;
        Ok(plan_cleanup(
            now,
            &observed.config.sinker,
            &observed.prow_jobs,
            &observed.pods,
            &observed.owners,
        ))
    }

    pub async fn clean(&self) -> Result<CleanReport, CleanError> {
        self.clean_at(Utc::now()).await
    }

    /// Run one garbage collection pass as of `now`
    pub async fn clean_at(&self, now: DateTime<Utc>) -> Result<CleanReport, CleanError> {
        let start = Instant::now();
        let result = self.clean_inner(now).await;
        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe_loop_duration(elapsed);

        match &result {
            Ok(report) => self.logger.log_pass_complete(
                elapsed,
                report.total_prow_jobs_cleaned() + report.total_pods_removed(),
                report.total_errors(),
            ),
            Err(_) => self.logger.log_pass_complete(elapsed, 0, 1),
        }
        result
    }

    async fn clean_inner(&self, now: DateTime<Utc>) -> Result<CleanReport, CleanError> {
        let observed = self.observe(now).await?;
        let plan = plan_cleanup(
            now,
            &observed.config.sinker,
            &observed.prow_jobs,
            &observed.pods,
            &observed.owners,
        );

        let mut report = CleanReport {
            dry_run: self.dry_run,
            prow_jobs_existing: observed.prow_jobs.len(),
            pods_existing: observed
                .pods
                .iter()
                .map(|(cluster, pods)| (cluster.clone(), pods.len()))
                .collect(),
            cluster_errors: observed.cluster_errors,
            ..CleanReport::default()
        };

        self.metrics.set_prowjobs_existing(report.prow_jobs_existing);
        for (cluster, count) in &report.pods_existing {
            self.metrics.set_pods_existing(cluster, *count);
        }

        self.execute(plan, &mut report).await;
        Ok(report)
    }

    /// List everything and resolve pod owners
    async fn observe(&self, now: DateTime<Utc>) -> Result<Observed, CleanError> {
        let config = self.config.current();

        let prow_jobs = self
            .prow_jobs
            .list(&config.prowjob_namespace)
            .await
            .map_err(CleanError::ListProwJobs)?;

        let (pods, cluster_errors) = self.list_pods(&config).await;

        let mut owners = OwnerIndex::from_listed(&prow_jobs);
        self.resolve_owners(now, &config, &pods, &mut owners).await;

        Ok(Observed {
            config,
            prow_jobs,
            pods,
            cluster_errors,
            owners,
        })
    }

    /// List prow pods in every non-excluded cluster concurrently
    ///
    /// A failing cluster is recorded and skipped.
    async fn list_pods(
        &self,
        config: &ProwConfig,
    ) -> (BTreeMap<String, Vec<Pod>>, BTreeMap<String, String>) {
        let mut tasks = JoinSet::new();
        for (cluster, store) in &self.pods {
            if config.sinker.is_excluded(cluster) {
                debug!(cluster = %cluster, "Skipping excluded cluster");
                continue;
            }
            let cluster = cluster.clone();
            let store = Arc::clone(store);
            let namespace = config.pod_namespace.clone();
            tasks.spawn(async move {
                let listed = store.list(&namespace).await;
                (cluster, listed)
            });
        }

        let mut pods = BTreeMap::new();
        let mut errors = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((cluster, Ok(listed))) => {
                    let prow_pods: Vec<Pod> =
                        listed.into_iter().filter(Pod::created_by_prow).collect();
                    pods.insert(cluster, prow_pods);
                }
                Ok((cluster, Err(e))) => {
                    error!(cluster = %cluster, error = %e, "Error listing pods");
                    errors.insert(cluster, e.to_string());
                }
                Err(e) => error!(error = %e, "Pod listing task failed"),
            }
        }
        (pods, errors)
    }

    /// Look up the owners of pods old enough to be orphans
    ///
    /// Direct gets bypass any list cache so a stale listing cannot make a
    /// live job look deleted. Lookup failures leave the owner unknown.
    async fn resolve_owners(
        &self,
        now: DateTime<Utc>,
        config: &ProwConfig,
        pods: &BTreeMap<String, Vec<Pod>>,
        owners: &mut OwnerIndex,
    ) {
        let grace = chrono::Duration::from_std(ORPHAN_GRACE_PERIOD)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let names: BTreeSet<String> = pods
            .values()
            .flatten()
            .filter(|pod| pod.creation_timestamp < now - grace)
            .filter_map(|pod| pod.owner().map(|o| o.prow_job_name.clone()))
            .collect();

        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_OWNER_LOOKUPS));
        let mut tasks = JoinSet::new();
        for name in names {
            let store = Arc::clone(&self.prow_jobs);
            let namespace = config.prowjob_namespace.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let fetched = store.get(&namespace, &name).await;
                (name, fetched)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(job))) => owners.record_found(job),
                Ok((name, Err(e))) if e.is_not_found() => owners.record_missing(name),
                Ok((name, Err(e))) => {
                    warn!(prowjob = %name, error = %e, "Error looking up pod owner");
                }
                Err(e) => error!(error = %e, "Owner lookup task failed"),
            }
        }
    }

    /// Issue every deletion: one task for ProwJobs, one per cluster for pods
    async fn execute(&self, plan: CleanPlan, report: &mut CleanReport) {
        let mut tasks = JoinSet::new();

        if !plan.prow_jobs.is_empty() {
            let store = Arc::clone(&self.prow_jobs);
            let metrics = self.metrics.clone();
            let logger = self.logger.clone();
            let dry_run = self.dry_run;
            tasks.spawn(delete_prow_jobs(
                store,
                plan.prow_jobs,
                dry_run,
                metrics,
                logger,
            ));
        }

        for (cluster, deletions) in plan.pods {
            let Some(store) = self.pods.get(&cluster).map(Arc::clone) else {
                warn!(cluster = %cluster, "No pod client for cluster");
                continue;
            };
            tasks.spawn(delete_pods(
                cluster,
                store,
                deletions,
                self.dry_run,
                self.metrics.clone(),
                self.logger.clone(),
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::ProwJobs { cleaned, errors }) => {
                    report.prow_jobs_cleaned = cleaned;
                    report.prow_job_errors = errors;
                }
                Ok(Outcome::Pods {
                    cluster,
                    removed,
                    errors,
                }) => {
                    if !removed.is_empty() {
                        report.pods_removed.insert(cluster.clone(), removed);
                    }
                    if !errors.is_empty() {
                        report.pod_removal_errors.insert(cluster, errors);
                    }
                }
                Err(e) => error!(error = %e, "Deletion task failed"),
            }
        }
    }
}

async fn delete_prow_jobs(
    store: ProwJobStore,
    deletions: Vec<ProwJobDeletion>,
    dry_run: bool,
    metrics: SinkerMetrics,
    logger: ControllerLogger,
) -> Outcome {
    let mut cleaned = BTreeMap::new();
    let mut errors = BTreeMap::new();

    for deletion in deletions {
        let result = if dry_run {
            Ok(())
        } else {
            store.delete(&deletion.namespace, &deletion.name).await
        };

        match result {
            Err(e) if !e.is_not_found() => {
                logger.log_deletion_failed("ProwJob", "", &deletion.name, &e.to_string());
                metrics.inc_prowjobs_cleaning_errors(e.reason());
                *errors.entry(e.reason().to_string()).or_insert(0) += 1;
            }
            _ => {
                let reason = deletion.reason.as_str();
                logger.log_prowjob_deleted(&deletion.name, &deletion.job, reason, dry_run);
                if !dry_run {
                    metrics.inc_prowjobs_cleaned(reason);
                }
                *cleaned.entry(reason.to_string()).or_insert(0) += 1;
            }
        }
    }

    Outcome::ProwJobs { cleaned, errors }
}

async fn delete_pods(
    cluster: String,
    store: PodStore,
    deletions: Vec<PodDeletion>,
    dry_run: bool,
    metrics: SinkerMetrics,
    logger: ControllerLogger,
) -> Outcome {
    let mut removed = BTreeMap::new();
    let mut errors = BTreeMap::new();

    for deletion in deletions {
        let result = if dry_run {
            Ok(())
        } else {
            store.delete(&deletion.namespace, &deletion.name).await
        };

        match result {
            Err(e) if !e.is_not_found() => {
                logger.log_deletion_failed("Pod", &cluster, &deletion.name, &e.to_string());
                metrics.inc_pod_removal_errors(&cluster, e.reason());
                *errors.entry(e.reason().to_string()).or_insert(0) += 1;
            }
            _ => {
                let reason = deletion.reason.as_str();
                logger.log_pod_deleted(&cluster, &deletion.name, reason, dry_run);
                if !dry_run {
                    metrics.inc_pods_removed(&cluster, reason);
                }
                *removed.entry(reason.to_string()).or_insert(0) += 1;
            }
        }
    }

    Outcome::Pods {
        cluster,
        removed,
        errors,
    }
}

#[async_trait]
impl Reconciler for Sinker {
    fn name(&self) -> &'static str {
        components::SINKER
    }

    fn interval(&self) -> Duration {
        self.config.current().sinker.resync_period
    }

    /// Fails only when the pass could not see everything it should clean;
    /// individual deletion failures are reported through metrics and logs.
    async fn reconcile(&self) -> anyhow::Result<()> {
        let report = self.clean().await?;
        if !report.cluster_errors.is_empty() {
            let clusters: Vec<&str> = report.cluster_errors.keys().map(String::as_str).collect();
            anyhow::bail!("could not list pods in cluster(s): {}", clusters.join(", "));
        }
        if let Some(summary) = report.error_summary() {
            warn!(errors = report.total_errors(), summary = %summary, "Garbage collection pass had errors");
        }
        Ok(())
    }
}
