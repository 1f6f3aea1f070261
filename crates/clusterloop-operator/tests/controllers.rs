//! Both controllers running against an in-memory server with two workspaces.

use clusterloop_core::{
    ClusterKey, ListFilter, LogicalCluster, MemoryClient, MergePatch, ResourceClient,
};
use clusterloop_operator::config::EngineConfig;
use clusterloop_operator::controllers::{ConfigMapReconciler, Context, WidgetReconciler};
use clusterloop_operator::crds::{Widget, WidgetSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ALICE: &str = "root:org:alice";
const BOB: &str = "root:org:bob";

struct Harness {
    client: Arc<MemoryClient>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    fn start() -> Self {
        let client = Arc::new(MemoryClient::new());
        let mut ctx = Context::new(client.clone(), LogicalCluster::wildcard());
        ctx.namespace_requeue = Duration::from_millis(20);
        let ctx = Arc::new(ctx);
        let engine = EngineConfig {
            workers: 2,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(50),
            relist_delay: Duration::from_millis(5),
        };

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(ConfigMapReconciler::controller(ctx.clone(), engine.clone()).run(cancel.clone())),
            tokio::spawn(WidgetReconciler::controller(ctx, engine).run(cancel.clone())),
        ];
        Self {
            client,
            cancel,
            tasks,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn config_map(name: &str, labels: &[(&str, &str)], data: &[(&str, &str)]) -> ConfigMap {
    let to_map = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    };
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(to_map(labels)),
            ..Default::default()
        },
        data: Some(to_map(data)),
        ..Default::default()
    }
}

fn widget(namespace: &str, name: &str) -> Widget {
    let mut w = Widget::new(
        name,
        WidgetSpec {
            foo: "bar".to_string(),
        },
    );
    w.metadata.namespace = Some(namespace.to_string());
    w
}

#[tokio::test]
async fn test_config_maps_reconcile_per_workspace() {
    let harness = Harness::start();
    let client = harness.client.clone();

    for (cluster, who) in [(ALICE, "alice"), (BOB, "bob")] {
        let cm = config_map(
            "kcp-edge",
            &[("name", who)],
            &[("namespace", who), ("secretData", &format!("{who}-secret"))],
        );
        client.create(&LogicalCluster::new(cluster), &cm).await.unwrap();
    }

    for (cluster, who) in [(ALICE, "alice"), (BOB, "bob")] {
        let cm_key = ClusterKey::namespaced(cluster, "default", "kcp-edge");
        let ns_key = ClusterKey::cluster_scoped(cluster, who);
        let client = client.clone();
        eventually("response label, namespace and secret", || {
            let client = client.clone();
            let cm_key = cm_key.clone();
            let ns_key = ns_key.clone();
            async move {
                let cm: ConfigMap = match client.get(&cm_key).await {
                    Ok(cm) => cm,
                    Err(_) => return false,
                };
                let labelled = cm.labels().get("response") == Some(&format!("hello-{who}"));
                let ns_exists = ResourceClient::<Namespace>::get(client.as_ref(), &ns_key)
                    .await
                    .is_ok();
                let secret = ResourceClient::<Secret>::get(client.as_ref(), &cm_key).await;
                let mirrored = secret.ok().and_then(|s| s.data).is_some_and(|d| {
                    d.get("dataFromCM").map(|v| v.0.clone()) == Some(format!("{who}-secret").into_bytes())
                });
                labelled && ns_exists && mirrored
            }
        })
        .await;
    }

    // Namespaces are created only in the workspace that asked for them.
    let stray = ClusterKey::cluster_scoped(ALICE, "bob");
    assert!(ResourceClient::<Namespace>::get(client.as_ref(), &stray)
        .await
        .unwrap_err()
        .is_not_found());

    let secret: Secret = client
        .get(&ClusterKey::namespaced(ALICE, "default", "kcp-edge"))
        .await
        .unwrap();
    let cm: ConfigMap = client
        .get(&ClusterKey::namespaced(ALICE, "default", "kcp-edge"))
        .await
        .unwrap();
    assert_eq!(secret.owner_references()[0].uid, cm.uid().unwrap());

    harness.stop().await;
}

#[tokio::test]
async fn test_widget_totals_track_their_workspace() {
    let harness = Harness::start();
    let client = harness.client.clone();

    let counts = [(ALICE, 3usize), (BOB, 5usize)];
    for (cluster, count) in counts {
        for i in 0..count {
            let ns = format!("ns-{}", i % 3);
            client
                .create(&LogicalCluster::new(cluster), &widget(&ns, &format!("w-{i}")))
                .await
                .unwrap();
        }
    }

    for (cluster, count) in counts {
        let client = client.clone();
        eventually("widget totals", || {
            let client = client.clone();
            async move {
                let widgets: Vec<Widget> = match client
                    .list(&LogicalCluster::new(cluster), &ListFilter::all())
                    .await
                {
                    Ok(listing) => listing.items,
                    Err(_) => return false,
                };
                widgets.len() == count && widgets.iter().all(|w| w.total() == count as i64)
            }
        })
        .await;
    }

    // A delete is picked up by the remaining widgets on their next reconcile.
    client
        .delete::<Widget>(&ClusterKey::namespaced(ALICE, "ns-0", "w-0"))
        .unwrap();
    let touch = MergePatch::new(serde_json::json!({ "spec": { "foo": "touched" } }));
    for (ns, name) in [("ns-1", "w-1"), ("ns-2", "w-2")] {
        let key = ClusterKey::namespaced(ALICE, ns, name);
        ResourceClient::<Widget>::patch(client.as_ref(), &key, &touch)
            .await
            .unwrap();
    }
    let c = client.clone();
    eventually("alice total after delete", || {
        let client = c.clone();
        async move {
            let widgets: Vec<Widget> = client
                .list(&LogicalCluster::new(ALICE), &ListFilter::all())
                .await
                .map(|l| l.items)
                .unwrap_or_default();
            widgets.len() == 2 && widgets.iter().all(|w| w.total() == 2)
        }
    })
    .await;

    let bob: Vec<Widget> = client
        .list(&LogicalCluster::new(BOB), &ListFilter::all())
        .await
        .unwrap()
        .items;
    assert!(bob.iter().all(|w| w.total() == 5));

    harness.stop().await;
}

#[tokio::test]
async fn test_deleted_secret_is_recreated_for_its_owner() {
    let harness = Harness::start();
    let client = harness.client.clone();
    let key = ClusterKey::namespaced(ALICE, "default", "owner");
    client
        .create(
            &LogicalCluster::new(ALICE),
            &config_map("owner", &[], &[("secretData", "payload")]),
        )
        .await
        .unwrap();

    let c = client.clone();
    let k = key.clone();
    eventually("secret created", || {
        let client = c.clone();
        let key = k.clone();
        async move { ResourceClient::<Secret>::get(client.as_ref(), &key).await.is_ok() }
    })
    .await;
    let first: Secret = client.get(&key).await.unwrap();

    client.delete::<Secret>(&key).unwrap();
    let c = client.clone();
    let k = key.clone();
    let old_uid = first.uid();
    eventually("secret recreated", || {
        let client = c.clone();
        let key = k.clone();
        let old_uid = old_uid.clone();
        async move {
            match ResourceClient::<Secret>::get(client.as_ref(), &key).await {
                Ok(secret) => {
                    secret.uid() != old_uid
                        && secret.data.as_ref().and_then(|d| d.get("dataFromCM")).map(|v| v.0.as_slice())
                            == Some(b"payload".as_slice())
                }
                Err(_) => false,
            }
        }
    })
    .await;

    harness.stop().await;
}
