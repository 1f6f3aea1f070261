//! List-then-watch trigger sources
//!
//! A source lists one kind in a cluster selector, queues the key of every
//! object it maps, then follows a resumable watch from the list's resource
//! version. When the watch reports an error (usually an expired resource
//! version) the source relists after a pause.

use super::queue::WorkQueue;
use clusterloop_core::{
    ClusterKey, ClusterResource, ListFilter, LogicalCluster, ResourceClient, ResumableWatch,
    WatchError,
};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maps an observed object to the key that should be reconciled, if any.
pub type Mapper<K> = Arc<dyn Fn(&K) -> Option<ClusterKey> + Send + Sync>;

/// Key of the object's controller owner of kind `O`, in the object's cluster
/// and namespace.
pub fn controller_owner<O: ClusterResource, K: ResourceExt>(obj: &K) -> Option<ClusterKey> {
    let kind = O::kind(&());
    let api_version = O::api_version(&());
    obj.owner_references()
        .iter()
        .find(|r| r.controller == Some(true) && r.kind == kind && r.api_version == api_version)
        .map(|r| ClusterKey::from_object(obj).sibling(r.name.clone()))
}

pub(crate) async fn run<K, C>(
    client: Arc<C>,
    cluster: LogicalCluster,
    mapper: Mapper<K>,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
    relist_delay: Duration,
) where
    K: ClusterResource,
    C: ResourceClient<K> + ?Sized,
{
    let kind = K::kind(&()).to_string();
    let everything = ListFilter::all();
    loop {
        let listed = tokio::select! {
            _ = cancel.cancelled() => return,
            listed = client.list(&cluster, &everything) => listed,
        };

        match listed {
            Ok(listing) => {
                debug!(kind = %kind, cluster = %cluster, count = listing.items.len(), "Listed");
                for obj in &listing.items {
                    if let Some(key) = mapper(obj) {
                        queue.add(key);
                    }
                }

                let mut watch = ResumableWatch::new(
                    client.clone(),
                    cluster.clone(),
                    ListFilter::all(),
                    listing.resource_version,
                );
                loop {
                    match watch.next(&cancel).await {
                        Ok(event) => {
                            if let Some(key) = event.object().and_then(|obj| mapper(obj)) {
                                queue.add(key);
                            }
                        }
                        Err(WatchError::Cancelled) => return,
                        Err(e) => {
                            info!(kind = %kind, cluster = %cluster, error = %e, "Watch failed, relisting");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(kind = %kind, cluster = %cluster, error = %e, "List failed, retrying");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(relist_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use clusterloop_core::{MemoryClient, WatchStatus};
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn primary() -> Mapper<ConfigMap> {
        Arc::new(|cm: &ConfigMap| Some(ClusterKey::from_object(cm)))
    }

    async fn drain(queue: &WorkQueue, n: usize) -> Vec<ClusterKey> {
        let mut keys = Vec::new();
        for _ in 0..n {
            let key = queue.next().await.unwrap();
            queue.done(&key);
            keys.push(key);
        }
        keys.sort();
        keys
    }

    #[test]
    fn test_controller_owner_mapping() {
        let owned = |controller: Option<bool>, kind: &str| Secret {
            metadata: ObjectMeta {
                name: Some("s".into()),
                namespace: Some("default".into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".into(),
                    kind: kind.into(),
                    name: "settings".into(),
                    uid: "1".into(),
                    controller,
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut secret = owned(Some(true), "ConfigMap");
        clusterloop_core::set_cluster(&mut secret, &LogicalCluster::new("root:a"));
        assert_eq!(
            controller_owner::<ConfigMap, _>(&secret),
            Some(ClusterKey::namespaced("root:a", "default", "settings"))
        );
        assert_eq!(controller_owner::<ConfigMap, _>(&owned(None, "ConfigMap")), None);
        assert_eq!(controller_owner::<ConfigMap, _>(&owned(Some(true), "Deployment")), None);
    }

    #[tokio::test]
    async fn test_list_then_watch_queues_keys() {
        let client = Arc::new(MemoryClient::new());
        let a = LogicalCluster::new("root:a");
        let b = LogicalCluster::new("root:b");
        client.create(&a, &config_map("one")).await.unwrap();

        let queue = Arc::new(WorkQueue::new("test", EngineConfig::default()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            client.clone(),
            LogicalCluster::wildcard(),
            primary(),
            queue.clone(),
            cancel.clone(),
            Duration::from_millis(10),
        ));

        assert_eq!(drain(&queue, 1).await, vec![ClusterKey::namespaced("root:a", "default", "one")]);

        client.create(&b, &config_map("one")).await.unwrap();
        assert_eq!(drain(&queue, 1).await, vec![ClusterKey::namespaced("root:b", "default", "one")]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_event_triggers_relist() {
        let client = Arc::new(MemoryClient::new());
        let a = LogicalCluster::new("root:a");
        client.create(&a, &config_map("one")).await.unwrap();

        let queue = Arc::new(WorkQueue::new("test", EngineConfig::default()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            client.clone(),
            a.clone(),
            primary(),
            queue.clone(),
            cancel.clone(),
            Duration::from_millis(1),
        ));
        drain(&queue, 1).await;

        while client.watcher_count() == 0 {
            tokio::task::yield_now().await;
        }
        client.emit_watch_error(WatchStatus {
            code: 410,
            reason: "Expired".into(),
            message: "resource version too old".into(),
        });

        // The relist queues the existing object again.
        assert_eq!(drain(&queue, 1).await, vec![ClusterKey::namespaced("root:a", "default", "one")]);

        cancel.cancel();
        task.await.unwrap();
    }
}
