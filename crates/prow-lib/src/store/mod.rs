//! Resource storage abstraction
//!
//! Both controllers talk to cluster state through [`ResourceStore`]. The
//! in-memory backend serves tests and dry runs; the kube backend wraps a
//! real API server connection.

mod kubernetes;
mod memory;

pub use kubernetes::{connect_clusters, prow_job_api_resource, KubePodStore, KubeProwJobStore};
pub use memory::MemoryStore;

use crate::models::{Pod, ProwJob};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by a resource store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} still has finalizers: {finalizers:?}")]
    FinalizersPresent {
        kind: &'static str,
        namespace: String,
        name: String,
        finalizers: Vec<String>,
    },

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("api error ({reason}): {message}")]
    Api { reason: String, message: String },

    #[error("failed to decode {kind}: {message}")]
    Decode { kind: &'static str, message: String },
}

impl StoreError {
    /// Stable reason string used as a metrics label
    pub fn reason(&self) -> &str {
        match self {
            StoreError::NotFound { .. } => "NotFound",
            StoreError::AlreadyExists { .. } => "AlreadyExists",
            StoreError::FinalizersPresent { .. } => "FinalizersPresent",
            StoreError::Unavailable(_) => "Unavailable",
            StoreError::Api { reason, .. } if !reason.is_empty() => reason,
            StoreError::Api { .. } => "Unknown",
            StoreError::Decode { .. } => "Decode",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// A namespaced, named object a store can hold
pub trait Resource: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn name(&self) -> &str;

    fn namespace(&self) -> &str;

    /// Finalizers blocking deletion
    fn finalizers(&self) -> &[String] {
        &[]
    }
}

impl Resource for ProwJob {
    const KIND: &'static str = "ProwJob";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Resource for Pod {
    const KIND: &'static str = "Pod";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn finalizers(&self) -> &[String] {
        &self.finalizers
    }
}

/// List/Get/Create/Delete access to one kind of resource in one cluster
#[async_trait]
pub trait ResourceStore<T: Resource>: Send + Sync {
    /// List every resource in the namespace
    async fn list(&self, namespace: &str) -> Result<Vec<T>, StoreError>;

    /// Fetch a single resource, bypassing any list cache
    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError>;

    async fn create(&self, item: T) -> Result<T, StoreError>;

    /// Delete a resource; `FinalizersPresent` when finalizers block removal
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

pub type ProwJobStore = Arc<dyn ResourceStore<ProwJob>>;
pub type PodStore = Arc<dyn ResourceStore<Pod>>;

/// Pod stores keyed by cluster name
pub type PodStores = BTreeMap<String, PodStore>;
