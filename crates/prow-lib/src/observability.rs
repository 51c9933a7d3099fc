//! Observability infrastructure for the controllers
//!
//! Provides:
//! - Prometheus metrics for garbage collection and periodic triggering
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for controller pass durations (in seconds)
const LOOP_DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

static SINKER_METRICS: OnceLock<SinkerMetricsInner> = OnceLock::new();
static HOROLOGIUM_METRICS: OnceLock<HorologiumMetricsInner> = OnceLock::new();

struct SinkerMetricsInner {
    pods_existing: IntGaugeVec,
    prowjobs_existing: IntGauge,
    pods_removed: IntCounterVec,
    pod_removal_errors: IntCounterVec,
    prowjobs_cleaned: IntCounterVec,
    prowjobs_cleaning_errors: IntCounterVec,
    loop_duration_seconds: Histogram,
}

impl SinkerMetricsInner {
    fn new() -> Self {
        Self {
            pods_existing: register_int_gauge_vec!(
                "sinker_pods_existing",
                "Number of prow pods seen in the last pass",
                &["cluster"]
            )
            .expect("Failed to register pods_existing"),

            prowjobs_existing: register_int_gauge!(
                "sinker_prowjobs_existing",
                "Number of ProwJobs seen in the last pass"
            )
            .expect("Failed to register prowjobs_existing"),

            pods_removed: register_int_counter_vec!(
                "sinker_pods_removed_total",
                "Pods deleted, by cluster and reason",
                &["cluster", "reason"]
            )
            .expect("Failed to register pods_removed"),

            pod_removal_errors: register_int_counter_vec!(
                "sinker_pod_removal_errors_total",
                "Failed pod deletions, by cluster and error reason",
                &["cluster", "reason"]
            )
            .expect("Failed to register pod_removal_errors"),

            prowjobs_cleaned: register_int_counter_vec!(
                "sinker_prowjobs_cleaned_total",
                "ProwJobs deleted, by reason",
                &["reason"]
            )
            .expect("Failed to register prowjobs_cleaned"),

            prowjobs_cleaning_errors: register_int_counter_vec!(
                "sinker_prowjobs_cleaning_errors_total",
                "Failed ProwJob deletions, by error reason",
                &["reason"]
            )
            .expect("Failed to register prowjobs_cleaning_errors"),

            loop_duration_seconds: register_histogram!(
                "sinker_loop_duration_seconds",
                "Time spent in one garbage collection pass",
                LOOP_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register sinker loop_duration_seconds"),
        }
    }
}

/// Sinker metrics handle; clones share the global instance
#[derive(Clone)]
pub struct SinkerMetrics {
    _private: (),
}

impl Default for SinkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkerMetrics {
    pub fn new() -> Self {
        SINKER_METRICS.get_or_init(SinkerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SinkerMetricsInner {
        SINKER_METRICS.get_or_init(SinkerMetricsInner::new)
    }

    pub fn set_pods_existing(&self, cluster: &str, count: usize) {
        self.inner()
            .pods_existing
            .with_label_values(&[cluster])
            .set(count as i64);
    }

    pub fn set_prowjobs_existing(&self, count: usize) {
        self.inner().prowjobs_existing.set(count as i64);
    }

    pub fn inc_pods_removed(&self, cluster: &str, reason: &str) {
        self.inner()
            .pods_removed
            .with_label_values(&[cluster, reason])
            .inc();
    }

    pub fn inc_pod_removal_errors(&self, cluster: &str, reason: &str) {
        self.inner()
            .pod_removal_errors
            .with_label_values(&[cluster, reason])
            .inc();
    }

    pub fn inc_prowjobs_cleaned(&self, reason: &str) {
        self.inner()
            .prowjobs_cleaned
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_prowjobs_cleaning_errors(&self, reason: &str) {
        self.inner()
            .prowjobs_cleaning_errors
            .with_label_values(&[reason])
            .inc();
    }

    pub fn observe_loop_duration(&self, duration_secs: f64) {
        self.inner().loop_duration_seconds.observe(duration_secs);
    }
}

struct HorologiumMetricsInner {
    prowjobs_triggered: IntCounterVec,
    trigger_errors: IntCounter,
    loop_duration_seconds: Histogram,
}

impl HorologiumMetricsInner {
    fn new() -> Self {
        Self {
            prowjobs_triggered: register_int_counter_vec!(
                "horologium_prowjobs_triggered_total",
                "Periodic runs created, by job name",
                &["job"]
            )
            .expect("Failed to register prowjobs_triggered"),

            trigger_errors: register_int_counter!(
                "horologium_trigger_errors_total",
                "Failed attempts to create a periodic run"
            )
            .expect("Failed to register trigger_errors"),

            loop_duration_seconds: register_histogram!(
                "horologium_loop_duration_seconds",
                "Time spent in one periodic triggering pass",
                LOOP_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register horologium loop_duration_seconds"),
        }
    }
}

/// Horologium metrics handle; clones share the global instance
#[derive(Clone)]
pub struct HorologiumMetrics {
    _private: (),
}

impl Default for HorologiumMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HorologiumMetrics {
    pub fn new() -> Self {
        HOROLOGIUM_METRICS.get_or_init(HorologiumMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &HorologiumMetricsInner {
        HOROLOGIUM_METRICS.get_or_init(HorologiumMetricsInner::new)
    }

    pub fn inc_triggered(&self, job: &str) {
        self.inner()
            .prowjobs_triggered
            .with_label_values(&[job])
            .inc();
    }

    pub fn inc_trigger_errors(&self) {
        self.inner().trigger_errors.inc();
    }

    pub fn observe_loop_duration(&self, duration_secs: f64) {
        self.inner().loop_duration_seconds.observe(duration_secs);
    }
}

/// Structured logger for controller events
///
/// Every event carries the controller name so both binaries can share a
/// log pipeline.
#[derive(Clone)]
pub struct ControllerLogger {
    controller: String,
}

impl ControllerLogger {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    pub fn log_startup(&self, version: &str, dry_run: bool) {
        info!(
            event = "controller_started",
            controller = %self.controller,
            version = %version,
            dry_run = dry_run,
            "Controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.controller,
            reason = %reason,
            "Controller shutting down"
        );
    }

    pub fn log_prowjob_deleted(&self, name: &str, job: &str, reason: &str, dry_run: bool) {
        info!(
            event = "prowjob_deleted",
            controller = %self.controller,
            prowjob = %name,
            job = %job,
            reason = %reason,
            dry_run = dry_run,
            "Deleted old completed ProwJob"
        );
    }

    pub fn log_pod_deleted(&self, cluster: &str, name: &str, reason: &str, dry_run: bool) {
        info!(
            event = "pod_deleted",
            controller = %self.controller,
            cluster = %cluster,
            pod = %name,
            reason = %reason,
            dry_run = dry_run,
            "Deleted pod"
        );
    }

    pub fn log_deletion_failed(&self, kind: &str, cluster: &str, name: &str, error: &str) {
        warn!(
            event = "deletion_failed",
            controller = %self.controller,
            kind = %kind,
            cluster = %cluster,
            name = %name,
            error = %error,
            "Failed to delete resource"
        );
    }

    pub fn log_periodic_triggered(&self, job: &str, prowjob: &str, reason: &str) {
        info!(
            event = "periodic_triggered",
            controller = %self.controller,
            job = %job,
            prowjob = %prowjob,
            reason = %reason,
            "Triggered new periodic run"
        );
    }

    pub fn log_pass_complete(&self, duration_secs: f64, actions: usize, errors: usize) {
        info!(
            event = "pass_complete",
            controller = %self.controller,
            duration_secs = duration_secs,
            actions = actions,
            errors = errors,
            "Controller pass complete"
        );
    }
}
