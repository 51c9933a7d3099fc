use super::cron::CronTrigger;
use super::policy::{latest_periodic_runs, periodics_to_trigger, PlannedTrigger};
use crate::config::ConfigProvider;
use crate::controller_loop::Reconciler;
use crate::health::components;
use crate::models::ProwJob;
use crate::observability::{ControllerLogger, HorologiumMetrics};
use crate::store::{ProwJobStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Default time between triggering passes
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("error listing prow jobs: {0}")]
    List(#[source] StoreError),

    #[error("failed to create {} periodic run(s): {}", .0.len(), describe_failures(.0))]
    Create(Vec<(String, StoreError)>),
}

fn describe_failures(failures: &[(String, StoreError)]) -> String {
    failures
        .iter()
        .map(|(job, err)| format!("{}: {}", job, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of one triggering pass
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// (job name, created ProwJob name) per new run
    pub triggered: Vec<(String, String)>,
}

/// Periodic job scheduler
pub struct Horologium {
    prow_jobs: ProwJobStore,
    config: Arc<dyn ConfigProvider>,
    cron: Arc<dyn CronTrigger>,
    tick_interval: Duration,
    metrics: HorologiumMetrics,
    logger: ControllerLogger,
}

impl Horologium {
    pub fn new(
        prow_jobs: ProwJobStore,
        config: Arc<dyn ConfigProvider>,
        cron: Arc<dyn CronTrigger>,
    ) -> Self {
        Self {
            prow_jobs,
            config,
            cron,
            tick_interval: DEFAULT_TICK_INTERVAL,
            metrics: HorologiumMetrics::new(),
            logger: ControllerLogger::new(components::HOROLOGIUM),
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Periodics that would be triggered at `now` given the cron queue
    ///
    /// Reads the store but changes nothing.
    pub async fn plan_at(
        &self,
        now: DateTime<Utc>,
        cron_queued: &HashSet<String>,
    ) -> Result<Vec<PlannedTrigger>, SyncError> {
        let config = self.config.current();
        let jobs = self
            .prow_jobs
            .list(&config.prowjob_namespace)
            .await
            .map_err(SyncError::List)?;

        let latest = latest_periodic_runs(&jobs);
        Ok(periodics_to_trigger(now, &config.periodics, &latest, cron_queued))
    }

    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        self.sync_at(Utc::now()).await
    }

    /// Run one triggering pass as of `now`
    pub async fn sync_at(&self, now: DateTime<Utc>) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        let result = self.sync_inner(now).await;
        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe_loop_duration(elapsed);

        let (actions, errors) = match &result {
            Ok(report) => (report.triggered.len(), 0),
            Err(SyncError::Create(failures)) => (0, failures.len()),
            Err(SyncError::List(_)) => (0, 1),
        };
        self.logger.log_pass_complete(elapsed, actions, errors);
        result
    }

    async fn sync_inner(&self, now: DateTime<Utc>) -> Result<SyncReport, SyncError> {
        let config = self.config.current();
        let jobs = self
            .prow_jobs
            .list(&config.prowjob_namespace)
            .await
            .map_err(SyncError::List)?;

        if let Err(e) = self.cron.sync_config(&config.periodics) {
            warn!(error = %e, "Error syncing cron jobs");
        }

        // Drained exactly once per pass
        let cron_queued: HashSet<String> = self.cron.queued_jobs().into_iter().collect();
        if !cron_queued.is_empty() {
            debug!(jobs = ?cron_queued, "Cron jobs queued");
        }

        let latest = latest_periodic_runs(&jobs);
        let planned = periodics_to_trigger(now, &config.periodics, &latest, &cron_queued);

        let mut report = SyncReport::default();
        let mut failures = Vec::new();

        for trigger in planned {
            let job = ProwJob::from_periodic(
                &trigger.periodic,
                &config.prowjob_namespace,
                config.scheduler.enabled,
                now,
            );
            let job_name = trigger.periodic.name;

            match self.prow_jobs.create(job).await {
                Ok(created) => {
                    self.metrics.inc_triggered(&job_name);
                    self.logger
                        .log_periodic_triggered(&job_name, &created.name, trigger.reason.as_str());
                    report.triggered.push((job_name, created.name));
                }
                Err(e) => {
                    self.metrics.inc_trigger_errors();
                    error!(job = %job_name, error = %e, "Failed to create periodic run");
                    failures.push((job_name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(SyncError::Create(failures))
        }
    }
}

#[async_trait]
impl Reconciler for Horologium {
    fn name(&self) -> &'static str {
        components::HOROLOGIUM
    }

    fn interval(&self) -> Duration {
        self.tick_interval
    }

    async fn reconcile(&self) -> anyhow::Result<()> {
        self.sync().await.map(|_| ()).map_err(Into::into)
    }
}
