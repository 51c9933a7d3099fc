//! Core data models shared by the controllers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Label set on every pod (and job) created by prow
pub const CREATED_BY_PROW_LABEL: &str = "created-by-prow";
/// Label on a pod naming the ProwJob it runs
pub const PROW_JOB_ID_LABEL: &str = "prow.k8s.io/id";
/// Label/annotation carrying the logical job name
pub const PROW_JOB_LABEL: &str = "prow.k8s.io/job";
/// Label carrying the job type
pub const PROW_JOB_TYPE_LABEL: &str = "prow.k8s.io/type";

/// Cluster used when a job does not name one
pub const DEFAULT_CLUSTER: &str = "default";

/// Kubernetes limit on label value length
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Kind of trigger that produced a ProwJob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProwJobType {
    Presubmit,
    Postsubmit,
    Periodic,
    Batch,
}

impl ProwJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProwJobType::Presubmit => "presubmit",
            ProwJobType::Postsubmit => "postsubmit",
            ProwJobType::Periodic => "periodic",
            ProwJobType::Batch => "batch",
        }
    }
}

/// Execution state of a ProwJob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProwJobState {
    /// Waiting for an external scheduler to pick a cluster
    Scheduling,
    #[default]
    Triggered,
    Pending,
    Success,
    Failure,
    Aborted,
    Error,
}

impl ProwJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProwJobState::Scheduling => "scheduling",
            ProwJobState::Triggered => "triggered",
            ProwJobState::Pending => "pending",
            ProwJobState::Success => "success",
            ProwJobState::Failure => "failure",
            ProwJobState::Aborted => "aborted",
            ProwJobState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProwJobSpec {
    #[serde(rename = "type")]
    pub job_type: ProwJobType,
    pub job: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProwJobStatus {
    #[serde(default)]
    pub state: ProwJobState,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// Last state each reporter has reported, keyed by reporter name
    #[serde(
        default,
        rename = "prev_report_states",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub prev_report_states: BTreeMap<String, ProwJobState>,
}

/// One execution of a CI job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProwJob {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub spec: ProwJobSpec,
    pub status: ProwJobStatus,
}

impl ProwJob {
    /// Create a freshly triggered job
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        job_type: ProwJobType,
        job: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: ProwJobSpec {
                job_type,
                job: job.into(),
                cluster: DEFAULT_CLUSTER.to_string(),
            },
            status: ProwJobStatus {
                state: ProwJobState::Triggered,
                start_time,
                completion_time: None,
                prev_report_states: BTreeMap::new(),
            },
        }
    }

    /// Build the ProwJob for a new run of a periodic
    ///
    /// The run starts in `scheduling` when an external scheduler gates
    /// execution, otherwise in `triggered`.
    pub fn from_periodic(
        periodic: &Periodic,
        namespace: &str,
        require_scheduling: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let name = uuid::Uuid::new_v4().to_string();

        let mut labels = periodic.labels.clone();
        labels.insert(CREATED_BY_PROW_LABEL.to_string(), "true".to_string());
        labels.insert(PROW_JOB_LABEL.to_string(), label_value(&periodic.name));
        labels.insert(
            PROW_JOB_TYPE_LABEL.to_string(),
            ProwJobType::Periodic.as_str().to_string(),
        );
        labels.insert(PROW_JOB_ID_LABEL.to_string(), name.clone());

        let mut annotations = periodic.annotations.clone();
        annotations.insert(PROW_JOB_LABEL.to_string(), periodic.name.clone());

        let mut job = Self::new(
            name,
            namespace,
            ProwJobType::Periodic,
            periodic.name.clone(),
            now,
        );
        job.labels = labels;
        job.annotations = annotations;
        job.spec.cluster = periodic.cluster.clone();
        job.status.state = if require_scheduling {
            ProwJobState::Scheduling
        } else {
            ProwJobState::Triggered
        };
        job
    }

    /// Mark the job finished; completion never precedes the start time
    pub fn finish(&mut self, state: ProwJobState, at: DateTime<Utc>) {
        self.status.state = state;
        self.status.completion_time = Some(at.max(self.status.start_time));
    }

    /// A job is complete iff its completion time is set
    pub fn complete(&self) -> bool {
        self.status.completion_time.is_some()
    }

    /// Logical job name (shared by every run)
    pub fn job_name(&self) -> &str {
        &self.spec.job
    }

    pub fn is_periodic(&self) -> bool {
        self.spec.job_type == ProwJobType::Periodic
    }
}

/// Truncate a value to a valid label value length
fn label_value(value: &str) -> String {
    value.chars().take(MAX_LABEL_VALUE_LEN).collect()
}

/// Lifecycle phase reported for a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse the phase string reported by the API server
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerState {
    Waiting {
        reason: Option<String>,
    },
    Running {
        started_at: Option<DateTime<Utc>>,
    },
    Terminated {
        exit_code: i32,
        finished_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStatus {
    pub name: String,
    pub state: Option<ContainerState>,
}

impl ContainerStatus {
    pub fn terminated(name: impl Into<String>, exit_code: i32, finished_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            state: Some(ContainerState::Terminated {
                exit_code,
                finished_at: Some(finished_at),
            }),
        }
    }

    pub fn running(name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            state: Some(ContainerState::Running {
                started_at: Some(started_at),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodStatus {
    pub phase: PodPhase,
    pub start_time: Option<DateTime<Utc>>,
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodStatus {
    /// Latest container finish time, if every container has terminated
    pub fn all_terminated_at(&self) -> Option<DateTime<Utc>> {
        if self.container_statuses.is_empty() {
            return None;
        }

        let mut latest: Option<DateTime<Utc>> = None;
        for status in &self.container_statuses {
            match &status.state {
                Some(ContainerState::Terminated {
                    finished_at: Some(finished_at),
                    ..
                }) => {
                    latest = Some(latest.map_or(*finished_at, |l| l.max(*finished_at)));
                }
                _ => return None,
            }
        }
        latest
    }
}

/// Typed link from a pod to the ProwJob it executes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    pub prow_job_name: String,
}

impl OwnerRef {
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        labels
            .get(PROW_JOB_ID_LABEL)
            .filter(|v| !v.is_empty())
            .map(|v| OwnerRef {
                prow_job_name: v.clone(),
            })
    }
}

/// Worker pod executing a ProwJob in some cluster
#[derive(Debug, Clone, PartialEq)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    labels: BTreeMap<String, String>,
    owner: Option<OwnerRef>,
    pub finalizers: Vec<String>,
    pub creation_timestamp: DateTime<Utc>,
    pub status: PodStatus,
}

impl Pod {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        creation_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            owner: None,
            finalizers: Vec::new(),
            creation_timestamp,
            status: PodStatus::default(),
        }
    }

    /// Replace the labels; the owner reference is derived from them
    pub fn with_labels<K, V>(mut self, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.owner = OwnerRef::from_labels(&self.labels);
        self
    }

    /// Labels marking the pod as running the given ProwJob
    pub fn for_prow_job(self, prow_job_name: &str) -> Self {
        self.with_labels([
            (CREATED_BY_PROW_LABEL, "true"),
            (PROW_JOB_ID_LABEL, prow_job_name),
        ])
    }

    pub fn with_finalizers<S: Into<String>>(mut self, finalizers: impl IntoIterator<Item = S>) -> Self {
        self.finalizers = finalizers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: PodStatus) -> Self {
        self.status = status;
        self
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn owner(&self) -> Option<&OwnerRef> {
        self.owner.as_ref()
    }

    pub fn created_by_prow(&self) -> bool {
        self.labels
            .get(CREATED_BY_PROW_LABEL)
            .is_some_and(|v| v == "true")
    }
}

/// How a periodic decides when to run
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Cron expression, normalised to include a seconds field
    Cron(String),
    /// Run again once this long has passed since the last start
    Interval(Duration),
    /// Run again once this long has passed since the last completion
    MinimumInterval(Duration),
}

/// Statically configured periodic job definition
#[derive(Debug, Clone, PartialEq)]
pub struct Periodic {
    pub name: String,
    pub trigger: Trigger,
    pub cluster: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Periodic {
    pub fn new(name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            trigger,
            cluster: DEFAULT_CLUSTER.to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn cron(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::Cron(expr) => Some(expr),
            _ => None,
        }
    }
}
