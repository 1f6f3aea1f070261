//! Cluster-aware resource client contract

use crate::cluster::{ClusterKey, LogicalCluster};
use crate::patch::MergePatch;
use crate::resource::ClusterResource;
use crate::watch::WatchEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Errors returned by a [`ResourceClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("conflict writing {kind} {key}: {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },

    #[error("writes require a concrete logical cluster, got the wildcard selector")]
    WildcardWrite,

    #[error("object has no name")]
    MissingName,

    #[error("namespaced object has no namespace")]
    MissingNamespace,

    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid cluster URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict { .. })
    }

    /// Classify a kube error raised while operating on `kind` at `key`.
    pub fn from_kube(err: kube::Error, kind: &str, key: impl ToString) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound {
                kind: kind.to_string(),
                key: key.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                ClientError::AlreadyExists {
                    kind: kind.to_string(),
                    key: key.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => ClientError::Conflict {
                kind: kind.to_string(),
                key: key.to_string(),
                message: resp.message.clone(),
            },
            _ => ClientError::Kube(err),
        }
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        ClientError::Kube(err)
    }
}

/// Narrows a list or watch beyond the cluster selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only objects in this namespace.
    pub namespace: Option<String>,
    /// Only the object with this exact name (`metadata.name` field selector).
    pub name: Option<String>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Field selector understood by the API server, if any.
    pub fn field_selector(&self) -> Option<String> {
        self.name.as_ref().map(|n| format!("metadata.name={n}"))
    }

    pub fn matches(&self, namespace: Option<&str>, name: &str) -> bool {
        self.namespace.as_deref().map_or(true, |ns| Some(ns) == namespace)
            && self.name.as_deref().map_or(true, |n| n == name)
    }
}

/// Result of a list call.
#[derive(Clone, Debug)]
pub struct Listing<K> {
    pub items: Vec<K>,
    /// Resource version to start a watch from so no change is missed.
    pub resource_version: Option<String>,
}

/// Stream of watch events for one kind.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, ClientError>>;

/// Read, write and watch access to one resource kind across logical clusters.
///
/// The cluster is always an explicit argument (or part of the key), so the
/// same `namespace/name` in two tenants never collides. Listing or watching
/// with the wildcard selector returns objects from every tenant plus any
/// ungrouped ones; writes require a concrete (or the empty) cluster.
#[async_trait]
pub trait ResourceClient<K: ClusterResource>: Send + Sync {
    async fn get(&self, key: &ClusterKey) -> Result<K, ClientError>;

    async fn list(
        &self,
        cluster: &LogicalCluster,
        filter: &ListFilter,
    ) -> Result<Listing<K>, ClientError>;

    async fn create(&self, cluster: &LogicalCluster, obj: &K) -> Result<K, ClientError>;

    /// Replace an object. Fails with [`ClientError::Conflict`] when the
    /// object's resource version is stale.
    async fn update(&self, cluster: &LogicalCluster, obj: &K) -> Result<K, ClientError>;

    async fn patch(&self, key: &ClusterKey, patch: &MergePatch) -> Result<K, ClientError>;

    /// Patch the status subresource only.
    async fn patch_status(&self, key: &ClusterKey, patch: &MergePatch) -> Result<K, ClientError>;

    /// Watch changes after `resource_version` (or from now when `None`).
    async fn watch(
        &self,
        cluster: &LogicalCluster,
        filter: &ListFilter,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<K>, ClientError>;
}
