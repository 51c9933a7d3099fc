//! Subcommand implementations

pub mod horologium;
pub mod jobs;
pub mod sinker;
pub mod status;

use anyhow::{Context, Result};
use prow_lib::store::{connect_clusters, KubePodStore, KubeProwJobStore, PodStore, PodStores, ProwJobStore};
use prow_lib::DEFAULT_CLUSTER;
use std::path::Path;
use std::sync::Arc;

/// Stores for the ProwJob cluster and every build cluster
pub(crate) async fn connect(build_clusters: Option<&Path>) -> Result<(ProwJobStore, PodStores)> {
    let clients = connect_clusters(build_clusters).await?;
    let default_client = clients
        .get(DEFAULT_CLUSTER)
        .cloned()
        .context("No client for the default cluster")?;

    let pods = clients
        .into_iter()
        .map(|(name, client)| (name, Arc::new(KubePodStore::new(client)) as PodStore))
        .collect();
    Ok((Arc::new(KubeProwJobStore::new(default_client)), pods))
}
