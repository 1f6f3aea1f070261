//! Worker pool driving a [`Reconciler`]

use super::queue::WorkQueue;
use super::source::{self, Mapper};
use super::{Action, Reconciler, Retryable};
use crate::config::EngineConfig;
use crate::observability::metrics::record_reconcile;
use clusterloop_core::{ClusterKey, ClusterResource, LogicalCluster, ResourceClient};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SourceTask = Box<dyn FnOnce(Arc<WorkQueue>, CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// Runs one reconciler against the keys produced by its trigger sources.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    config: EngineConfig,
    queue: Arc<WorkQueue>,
    sources: Vec<SourceTask>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, config: EngineConfig) -> Self {
        let queue = Arc::new(WorkQueue::new(R::NAME, config.clone()));
        Self {
            reconciler,
            config,
            queue,
            sources: Vec::new(),
        }
    }

    /// The controller's work queue, e.g. to queue keys by hand.
    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Reconcile every object of kind `K` seen in `cluster`.
    pub fn watches<K, C>(self, client: Arc<C>, cluster: LogicalCluster) -> Self
    where
        K: ClusterResource,
        C: ResourceClient<K> + ?Sized + 'static,
    {
        self.watches_with(client, cluster, Arc::new(|obj: &K| Some(ClusterKey::from_object(obj))))
    }

    /// Reconcile the keys `mapper` derives from objects of kind `K`, e.g. the
    /// owner of a child object.
    pub fn watches_with<K, C>(mut self, client: Arc<C>, cluster: LogicalCluster, mapper: Mapper<K>) -> Self
    where
        K: ClusterResource,
        C: ResourceClient<K> + ?Sized + 'static,
    {
        let relist_delay = self.config.relist_delay;
        self.sources.push(Box::new(move |queue, cancel| {
            Box::pin(source::run(client, cluster, mapper, queue, cancel, relist_delay))
        }));
        self
    }

    /// Run sources and workers until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let workers = self.config.workers.max(1);
        info!(controller = R::NAME, workers, "Starting controller");

        let mut tasks = JoinSet::new();
        for source in self.sources {
            tasks.spawn(source(self.queue.clone(), cancel.clone()));
        }
        for _ in 0..workers {
            tasks.spawn(worker(self.reconciler.clone(), self.queue.clone(), cancel.clone()));
        }

        cancel.cancelled().await;
        self.queue.shutdown();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(controller = R::NAME, error = %e, "Controller task ended abnormally");
            }
        }
        info!(controller = R::NAME, "Controller stopped");
    }
}

async fn worker<R: Reconciler>(reconciler: Arc<R>, queue: Arc<WorkQueue>, cancel: CancellationToken) {
    while let Some(key) = queue.next().await {
        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                queue.done(&key);
                break;
            }
            result = reconciler.reconcile(&key) => result,
        };
        handle_result::<R>(&queue, &key, result, started);
        queue.done(&key);
    }
}

fn handle_result<R: Reconciler>(
    queue: &Arc<WorkQueue>,
    key: &ClusterKey,
    result: Result<Action, R::Error>,
    started: Instant,
) {
    let elapsed = started.elapsed();
    match result {
        Ok(action) => {
            queue.forget(key);
            record_reconcile(R::NAME, "success", elapsed);
            match action {
                Action::Done => debug!(controller = R::NAME, key = %key, "Reconciled"),
                Action::RequeueAfter(after) => {
                    debug!(controller = R::NAME, key = %key, after = ?after, "Reconciled, requeueing");
                    queue.add_after(key.clone(), after);
                }
            }
        }
        Err(e) => {
            let retryable = e.is_retryable();
            let retry_in = queue.add_rate_limited(key.clone());
            error!(
                controller = R::NAME,
                key = %key,
                error = %e,
                retryable,
                retry_in = ?retry_in,
                "Reconcile failed"
            );
            record_reconcile(R::NAME, "error", elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clusterloop_core::MemoryClient;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("flaky")]
    struct Flaky {
        retryable: bool,
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    /// Records calls and the peak concurrency per key.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<HashMap<ClusterKey, usize>>,
        running: Mutex<HashMap<ClusterKey, usize>>,
        peak: Mutex<usize>,
        fail_first: bool,
        fail_terminally: bool,
        requeue: Option<Duration>,
    }

    impl Recorder {
        fn calls(&self, key: &ClusterKey) -> usize {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Reconciler for Recorder {
        type Error = Flaky;
        const NAME: &'static str = "recorder";

        async fn reconcile(&self, key: &ClusterKey) -> Result<Action, Flaky> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(key.clone()).or_default();
                *n += 1;
                *n
            };
            {
                let mut running = self.running.lock().unwrap();
                let n = running.entry(key.clone()).or_default();
                *n += 1;
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(*n);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            *self.running.lock().unwrap().get_mut(key).unwrap() -= 1;

            if self.fail_first && call == 1 {
                return Err(Flaky {
                    retryable: !self.fail_terminally,
                });
            }
            Ok(match self.requeue {
                Some(after) if call == 1 => Action::requeue(after),
                _ => Action::await_change(),
            })
        }
    }

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

    fn engine_config() -> EngineConfig {
        EngineConfig {
            workers: 4,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            relist_delay: Duration::from_millis(5),
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_same_key_never_runs_concurrently() {
        let recorder = Arc::new(Recorder::default());
        let controller = Controller::new(recorder.clone(), engine_config());
        let queue = controller.queue();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        let k = ClusterKey::namespaced("root:a", "default", "x");
        for _ in 0..20 {
            queue.add(k.clone());
            tokio::task::yield_now().await;
        }
        wait_for(|| queue.is_empty() && recorder.calls(&k) >= 1).await;

        assert_eq!(*recorder.peak.lock().unwrap(), 1);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_is_retried_and_success_resets_backoff() {
        let recorder = Arc::new(Recorder {
            fail_first: true,
            ..Default::default()
        });
        let controller = Controller::new(recorder.clone(), engine_config());
        let queue = controller.queue();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        let k = ClusterKey::namespaced("root:a", "default", "x");
        queue.add(k.clone());
        wait_for(|| recorder.calls(&k) == 2).await;
        wait_for(|| queue.failures(&k) == 0).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_retryable_error_uses_normal_backoff() {
        let recorder = Arc::new(Recorder {
            fail_first: true,
            fail_terminally: true,
            ..Default::default()
        });
        let config = EngineConfig {
            backoff_max: Duration::from_secs(3600),
            ..engine_config()
        };
        let controller = Controller::new(recorder.clone(), config);
        let queue = controller.queue();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        let k = ClusterKey::namespaced("root:a", "default", "dup");
        queue.add(k.clone());
        wait_for(|| recorder.calls(&k) == 2).await;
        wait_for(|| queue.failures(&k) == 0).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_requeue_after_schedules_another_pass() {
        let recorder = Arc::new(Recorder {
            requeue: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        let controller = Controller::new(recorder.clone(), engine_config());
        let queue = controller.queue();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        let k = ClusterKey::cluster_scoped("root:a", "ns-1");
        queue.add(k.clone());
        wait_for(|| recorder.calls(&k) == 2).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_watched_objects_are_reconciled_per_cluster() {
        let client = Arc::new(MemoryClient::new());
        client
            .create(&LogicalCluster::new("root:a"), &config_map("x"))
            .await
            .unwrap();
        client
            .create(&LogicalCluster::new("root:b"), &config_map("x"))
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let controller = Controller::new(recorder.clone(), engine_config())
            .watches::<ConfigMap, _>(client.clone(), LogicalCluster::wildcard());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        let a = ClusterKey::namespaced("root:a", "default", "x");
        let b = ClusterKey::namespaced("root:b", "default", "x");
        wait_for(|| recorder.calls(&a) == 1 && recorder.calls(&b) == 1).await;

        cancel.cancel();
        handle.await.unwrap();
    }
}
