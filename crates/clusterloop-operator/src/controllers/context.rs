//! Shared controller context

use crate::crds::Widget;
use clusterloop_core::{ClusterResource, LogicalCluster, ResourceClient};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use std::sync::Arc;
use std::time::Duration;

/// Resource client serving every kind the controllers touch.
pub trait ClusterClient:
    ResourceClient<ConfigMap>
    + ResourceClient<Secret>
    + ResourceClient<Namespace>
    + ResourceClient<Widget>
    + 'static
{
}

impl<T> ClusterClient for T where
    T: ResourceClient<ConfigMap>
        + ResourceClient<Secret>
        + ResourceClient<Namespace>
        + ResourceClient<Widget>
        + 'static
{
}

/// Shared context for all controllers.
pub struct Context<C> {
    pub client: Arc<C>,
    /// Selector covering every logical cluster served: the wildcard behind a
    /// virtual workspace, the empty cluster against a plain API server.
    pub all_clusters: LogicalCluster,
    /// Delay before re-checking a namespace that was just created.
    pub namespace_requeue: Duration,
}

impl<C: ClusterClient> Context<C> {
    pub fn new(client: Arc<C>, all_clusters: LogicalCluster) -> Self {
        Self {
            client,
            all_clusters,
            namespace_requeue: Duration::from_secs(5),
        }
    }

    /// The client viewed as a client for kind `K`.
    pub fn api<K: ClusterResource>(&self) -> &dyn ResourceClient<K>
    where
        C: ResourceClient<K>,
    {
        self.client.as_ref()
    }
}
