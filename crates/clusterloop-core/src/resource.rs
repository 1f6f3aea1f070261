//! Resource kinds served through the cluster-aware clients

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::{Api, Client, Resource};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

/// A resource kind the cluster-aware clients know how to address.
///
/// Each concrete kind states its scope and whether it has a status
/// subresource, and builds a typed [`Api`] for a client already pointed at
/// one logical cluster.
pub trait ClusterResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Whether objects of this kind live inside a namespace.
    const NAMESPACED: bool;

    /// Whether `status` is served as a separate subresource.
    const STATUS_SUBRESOURCE: bool = false;

    /// Typed API handle, namespaced when `namespace` is given.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;

    /// Unique identifier of the kind, e.g. `v1/ConfigMap`.
    fn type_key() -> String {
        format!("{}/{}", Self::api_version(&()), Self::kind(&()))
    }
}

/// Implements [`ClusterResource`] for a namespaced kind.
#[macro_export]
macro_rules! namespaced_resource {
    ($kind:ty) => {
        $crate::namespaced_resource!($kind, false);
    };
    ($kind:ty, $status:expr) => {
        impl $crate::ClusterResource for $kind {
            const NAMESPACED: bool = true;
            const STATUS_SUBRESOURCE: bool = $status;

            fn api(client: ::kube::Client, namespace: Option<&str>) -> ::kube::Api<Self> {
                match namespace {
                    Some(ns) => ::kube::Api::namespaced(client, ns),
                    None => ::kube::Api::all(client),
                }
            }
        }
    };
}

/// Implements [`ClusterResource`] for a cluster-scoped kind.
#[macro_export]
macro_rules! cluster_scoped_resource {
    ($kind:ty) => {
        $crate::cluster_scoped_resource!($kind, false);
    };
    ($kind:ty, $status:expr) => {
        impl $crate::ClusterResource for $kind {
            const NAMESPACED: bool = false;
            const STATUS_SUBRESOURCE: bool = $status;

            fn api(client: ::kube::Client, _namespace: Option<&str>) -> ::kube::Api<Self> {
                ::kube::Api::all(client)
            }
        }
    };
}

namespaced_resource!(ConfigMap);
namespaced_resource!(Secret);
cluster_scoped_resource!(Namespace, true);
