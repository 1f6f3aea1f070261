//! kcp-aware client backed by kube-rs
//!
//! kcp serves every logical cluster under `/clusters/<name>` of the same
//! server (or virtual workspace) URL, and all of them at once under
//! `/clusters/*`. One `kube::Client` is built per logical cluster on first use
//! and cached.

use crate::client::{ClientError, ListFilter, Listing, ResourceClient, WatchStream};
use crate::cluster::{ClusterKey, LogicalCluster};
use crate::patch::MergePatch;
use crate::resource::ClusterResource;
use crate::watch::WatchEvent;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{ListParams, Patch, PatchParams, PostParams, WatchParams};
use kube::{Client, Config, ResourceExt};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Resource client talking to a kcp (or plain Kubernetes) API server.
pub struct KcpClient {
    base: Config,
    clients: RwLock<HashMap<LogicalCluster, Client>>,
}

impl KcpClient {
    /// Client for the server described by `config`.
    pub fn new(config: Config) -> Self {
        Self {
            base: config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Client for the same credentials pointed at another base URL, such as
    /// an APIExport virtual workspace.
    pub fn with_host(config: &Config, url: &str) -> Result<Self, ClientError> {
        let mut config = config.clone();
        config.cluster_url = url
            .parse()
            .map_err(|e| ClientError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::new(config))
    }

    pub fn base_url(&self) -> String {
        self.base.cluster_url.to_string()
    }

    /// The kube client addressing `cluster`.
    pub fn client(&self, cluster: &LogicalCluster) -> Result<Client, ClientError> {
        if let Some(client) = self
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cluster)
        {
            return Ok(client.clone());
        }

        let mut config = self.base.clone();
        if let Some(prefix) = cluster.path_prefix() {
            let url = format!(
                "{}{}",
                self.base.cluster_url.to_string().trim_end_matches('/'),
                prefix
            );
            config.cluster_url = url
                .parse()
                .map_err(|e| ClientError::InvalidUrl(format!("{url}: {e}")))?;
        }
        debug!(cluster = %cluster, url = %config.cluster_url, "Building cluster client");
        let client = Client::try_from(config)?;

        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cluster.clone(), client.clone());
        Ok(client)
    }

    /// Whether the server offers `group` at `version` in API discovery.
    pub async fn serves_group(&self, group: &str, version: &str) -> Result<bool, ClientError> {
        let groups = self
            .client(&LogicalCluster::empty())?
            .list_api_groups()
            .await?;
        Ok(groups
            .groups
            .iter()
            .filter(|g| g.name == group)
            .any(|g| g.versions.iter().any(|v| v.version == version)))
    }

    fn writable(cluster: &LogicalCluster) -> Result<(), ClientError> {
        if cluster.is_wildcard() {
            Err(ClientError::WildcardWrite)
        } else {
            Ok(())
        }
    }
}

fn list_params(filter: &ListFilter) -> ListParams {
    match filter.field_selector() {
        Some(fields) => ListParams::default().fields(&fields),
        None => ListParams::default(),
    }
}

fn watch_params(filter: &ListFilter) -> WatchParams {
    match filter.field_selector() {
        Some(fields) => WatchParams::default().fields(&fields),
        None => WatchParams::default(),
    }
}

#[async_trait]
impl<K: ClusterResource> ResourceClient<K> for KcpClient {
    async fn get(&self, key: &ClusterKey) -> Result<K, ClientError> {
        K::api(self.client(&key.cluster)?, key.namespace())
            .get(&key.name)
            .await
            .map_err(|e| ClientError::from_kube(e, &K::kind(&()), key))
    }

    async fn list(
        &self,
        cluster: &LogicalCluster,
        filter: &ListFilter,
    ) -> Result<Listing<K>, ClientError> {
        let list = K::api(self.client(cluster)?, filter.namespace.as_deref())
            .list(&list_params(filter))
            .await?;
        Ok(Listing {
            resource_version: list.metadata.resource_version,
            items: list.items,
        })
    }

    async fn create(&self, cluster: &LogicalCluster, obj: &K) -> Result<K, ClientError> {
        Self::writable(cluster)?;
        let key = ClusterKey::new(cluster.clone(), obj.namespace().as_deref(), obj.name_any());
        K::api(self.client(cluster)?, key.namespace())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| ClientError::from_kube(e, &K::kind(&()), &key))
    }

    async fn update(&self, cluster: &LogicalCluster, obj: &K) -> Result<K, ClientError> {
        Self::writable(cluster)?;
        let key = ClusterKey::new(cluster.clone(), obj.namespace().as_deref(), obj.name_any());
        K::api(self.client(cluster)?, key.namespace())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| ClientError::from_kube(e, &K::kind(&()), &key))
    }

    async fn patch(&self, key: &ClusterKey, patch: &MergePatch) -> Result<K, ClientError> {
        Self::writable(&key.cluster)?;
        K::api(self.client(&key.cluster)?, key.namespace())
            .patch(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(patch.as_value()),
            )
            .await
            .map_err(|e| ClientError::from_kube(e, &K::kind(&()), key))
    }

    async fn patch_status(&self, key: &ClusterKey, patch: &MergePatch) -> Result<K, ClientError> {
        Self::writable(&key.cluster)?;
        K::api(self.client(&key.cluster)?, key.namespace())
            .patch_status(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(patch.as_value()),
            )
            .await
            .map_err(|e| ClientError::from_kube(e, &K::kind(&()), key))
    }

    async fn watch(
        &self,
        cluster: &LogicalCluster,
        filter: &ListFilter,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<K>, ClientError> {
        let stream = K::api(self.client(cluster)?, filter.namespace.as_deref())
            .watch(&watch_params(filter), resource_version.unwrap_or("0"))
            .await?;
        Ok(stream
            .map_ok(WatchEvent::from)
            .map_err(ClientError::from)
            .boxed())
    }
}
