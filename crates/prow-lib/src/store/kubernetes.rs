//! Kubernetes-backed resource stores
//!
//! ProwJobs are read through the dynamic API (the CRD has no generated
//! bindings here) and decoded into the crate's model with serde. Pods use the
//! typed `k8s-openapi` bindings.

use super::{ResourceStore, StoreError};
use crate::models::{
    ContainerState, ContainerStatus, Pod, PodPhase, PodStatus, ProwJob, ProwJobSpec,
    ProwJobStatus, CREATED_BY_PROW_LABEL, DEFAULT_CLUSTER,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

const PROW_JOB_GROUP: &str = "prow.k8s.io";
const PROW_JOB_VERSION: &str = "v1";
const PROW_JOB_KIND: &str = "ProwJob";
const PROW_JOB_PLURAL: &str = "prowjobs";

/// API resource descriptor of the ProwJob CRD
pub fn prow_job_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(PROW_JOB_GROUP, PROW_JOB_VERSION, PROW_JOB_KIND),
        PROW_JOB_PLURAL,
    )
}

/// Connect to the default cluster and every context of a build-cluster kubeconfig
///
/// The ambient kube config becomes the `default` cluster; each context in
/// `build_kubeconfig` becomes a cluster named after the context.
pub async fn connect_clusters(
    build_kubeconfig: Option<&Path>,
) -> anyhow::Result<BTreeMap<String, Client>> {
    let mut clients = BTreeMap::new();

    let default = Client::try_default()
        .await
        .context("Failed to create default cluster client")?;
    clients.insert(DEFAULT_CLUSTER.to_string(), default);

    if let Some(path) = build_kubeconfig {
        let kubeconfig = Kubeconfig::read_from(path)
            .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;

        for context in &kubeconfig.contexts {
            let options = KubeConfigOptions {
                context: Some(context.name.clone()),
                ..Default::default()
            };
            let config = kube::Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
                .await
                .with_context(|| format!("Invalid kubeconfig context {}", context.name))?;
            let client = Client::try_from(config)
                .with_context(|| format!("Failed to create client for {}", context.name))?;

            info!(cluster = %context.name, "Connected build cluster");
            clients.insert(context.name.clone(), client);
        }
    }

    Ok(clients)
}

fn map_kube_error(kind: &'static str, namespace: &str, name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 => StoreError::AlreadyExists {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) => StoreError::Api {
            reason: resp.reason,
            message: resp.message,
        },
        kube::Error::SerdeError(e) => StoreError::Decode {
            kind,
            message: e.to_string(),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}

/// ProwJob store backed by the ProwJob custom resource
#[derive(Clone)]
pub struct KubeProwJobStore {
    client: Client,
    resource: ApiResource,
}

impl KubeProwJobStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: prow_job_api_resource(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

fn decode_error(message: impl Into<String>) -> StoreError {
    StoreError::Decode {
        kind: PROW_JOB_KIND,
        message: message.into(),
    }
}

/// Decode a ProwJob custom resource
fn prow_job_from_dynamic(obj: DynamicObject) -> Result<ProwJob, StoreError> {
    let created = obj
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);

    let spec = obj
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| decode_error("missing spec"))?;
    let spec: ProwJobSpec =
        serde_json::from_value(spec).map_err(|e| decode_error(e.to_string()))?;

    // Jobs created moments ago may not carry a start time yet
    let mut status = obj.data.get("status").cloned().unwrap_or_else(|| json!({}));
    if let Some(map) = status.as_object_mut() {
        map.entry("startTime").or_insert_with(|| json!(created));
    }
    let status: ProwJobStatus =
        serde_json::from_value(status).map_err(|e| decode_error(e.to_string()))?;

    Ok(ProwJob {
        name: obj.metadata.name.unwrap_or_default(),
        namespace: obj.metadata.namespace.unwrap_or_default(),
        labels: obj.metadata.labels.unwrap_or_default(),
        annotations: obj.metadata.annotations.unwrap_or_default(),
        spec,
        status,
    })
}

fn prow_job_to_dynamic(job: &ProwJob, resource: &ApiResource) -> Result<DynamicObject, StoreError> {
    let spec = serde_json::to_value(&job.spec).map_err(|e| decode_error(e.to_string()))?;
    let status = serde_json::to_value(&job.status).map_err(|e| decode_error(e.to_string()))?;

    let mut obj = DynamicObject::new(&job.name, resource).within(&job.namespace);
    obj.metadata.labels = Some(job.labels.clone());
    obj.metadata.annotations = Some(job.annotations.clone());
    obj.data = json!({ "spec": spec, "status": status });
    Ok(obj)
}

#[async_trait]
impl ResourceStore<ProwJob> for KubeProwJobStore {
    async fn list(&self, namespace: &str) -> Result<Vec<ProwJob>, StoreError> {
        let list = self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(PROW_JOB_KIND, namespace, "", e))?;

        list.items.into_iter().map(prow_job_from_dynamic).collect()
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<ProwJob, StoreError> {
        let obj = self
            .api(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error(PROW_JOB_KIND, namespace, name, e))?;
        prow_job_from_dynamic(obj)
    }

    async fn create(&self, item: ProwJob) -> Result<ProwJob, StoreError> {
        let obj = prow_job_to_dynamic(&item, &self.resource)?;
        let created = self
            .api(&item.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_error(PROW_JOB_KIND, &item.namespace, &item.name, e))?;
        prow_job_from_dynamic(created)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let outcome = self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(PROW_JOB_KIND, namespace, name, e))?;

        let finalizers = outcome.either(
            |obj| obj.metadata.finalizers.unwrap_or_default(),
            |_status| Vec::new(),
        );
        if finalizers.is_empty() {
            Ok(())
        } else {
            Err(StoreError::FinalizersPresent {
                kind: PROW_JOB_KIND,
                namespace: namespace.to_string(),
                name: name.to_string(),
                finalizers,
            })
        }
    }
}

/// Pod store for one cluster
#[derive(Clone)]
pub struct KubePodStore {
    client: Client,
}

impl KubePodStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<corev1::Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn container_from_kube(status: corev1::ContainerStatus) -> ContainerStatus {
    let state = status.state.and_then(|state| {
        if let Some(terminated) = state.terminated {
            Some(ContainerState::Terminated {
                exit_code: terminated.exit_code,
                finished_at: terminated.finished_at.map(|t| t.0),
            })
        } else if let Some(running) = state.running {
            Some(ContainerState::Running {
                started_at: running.started_at.map(|t| t.0),
            })
        } else {
            state.waiting.map(|waiting| ContainerState::Waiting {
                reason: waiting.reason,
            })
        }
    });

    ContainerStatus {
        name: status.name,
        state,
    }
}

/// Convert an API pod into the crate's model, deriving its owner reference
fn pod_from_kube(pod: corev1::Pod) -> Pod {
    let meta = pod.metadata;
    let created = meta
        .creation_timestamp
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);
    let status = pod.status.unwrap_or_default();

    Pod::new(
        meta.name.unwrap_or_default(),
        meta.namespace.unwrap_or_default(),
        created,
    )
    .with_labels(meta.labels.unwrap_or_default())
    .with_finalizers(meta.finalizers.unwrap_or_default())
    .with_status(PodStatus {
        phase: status
            .phase
            .as_deref()
            .map(PodPhase::parse)
            .unwrap_or_default(),
        start_time: status.start_time.map(|t| t.0),
        container_statuses: status
            .container_statuses
            .unwrap_or_default()
            .into_iter()
            .map(container_from_kube)
            .collect(),
    })
}

#[async_trait]
impl ResourceStore<Pod> for KubePodStore {
    async fn list(&self, namespace: &str) -> Result<Vec<Pod>, StoreError> {
        let params = ListParams::default().labels(&format!("{}=true", CREATED_BY_PROW_LABEL));
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| map_kube_error("Pod", namespace, "", e))?;

        Ok(list.items.into_iter().map(pod_from_kube).collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, StoreError> {
        self.api(namespace)
            .get(name)
            .await
            .map(pod_from_kube)
            .map_err(|e| map_kube_error("Pod", namespace, name, e))
    }

    async fn create(&self, item: Pod) -> Result<Pod, StoreError> {
        // Pod specs belong to the job executor; this store only observes them.
        Err(StoreError::Api {
            reason: "MethodNotAllowed".to_string(),
            message: format!("refusing to create pod {}/{}", item.namespace, item.name),
        })
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let outcome = self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error("Pod", namespace, name, e))?;

        // A returned object means deletion is pending; finalizers keep it alive.
        let finalizers = outcome.either(
            |pod| pod.metadata.finalizers.unwrap_or_default(),
            |_status| Vec::new(),
        );
        if finalizers.is_empty() {
            Ok(())
        } else {
            Err(StoreError::FinalizersPresent {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
                finalizers,
            })
        }
    }
}
