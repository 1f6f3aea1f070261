//! Watch events and a watch that resumes after disconnects
//!
//! API servers close idle watches after a timeout. [`ResumableWatch`] keeps the
//! resource version of the last event it delivered and reopens the watch from
//! there, so a closed stream never loses an event.

use crate::client::{ClientError, ListFilter, ResourceClient, WatchStream};
use crate::cluster::LogicalCluster;
use crate::resource::ClusterResource;
use futures::StreamExt;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Status carried by a watch `Error` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchStatus {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl std::fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.reason, self.code, self.message)
    }
}

/// One change observed by a watch.
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying only a resource version.
    Bookmark { resource_version: String },
    Error(WatchStatus),
}

impl<K: ResourceExt> WatchEvent<K> {
    /// The object carried by the event, if any.
    pub fn object(&self) -> Option<&K> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                Some(obj)
            }
            WatchEvent::Bookmark { .. } | WatchEvent::Error(_) => None,
        }
    }

    /// Resource version this event advances the watch to.
    pub fn resource_version(&self) -> Option<String> {
        match self {
            WatchEvent::Bookmark { resource_version } => Some(resource_version.clone()),
            WatchEvent::Error(_) => None,
            _ => self.object().and_then(|o| o.resource_version()),
        }
    }

    /// Event type name as used on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
            WatchEvent::Bookmark { .. } => "BOOKMARK",
            WatchEvent::Error(_) => "ERROR",
        }
    }
}

impl<K> From<kube::api::WatchEvent<K>> for WatchEvent<K> {
    fn from(event: kube::api::WatchEvent<K>) -> Self {
        match event {
            kube::api::WatchEvent::Added(obj) => WatchEvent::Added(obj),
            kube::api::WatchEvent::Modified(obj) => WatchEvent::Modified(obj),
            kube::api::WatchEvent::Deleted(obj) => WatchEvent::Deleted(obj),
            kube::api::WatchEvent::Bookmark(bm) => WatchEvent::Bookmark {
                resource_version: bm.metadata.resource_version,
            },
            kube::api::WatchEvent::Error(resp) => WatchEvent::Error(WatchStatus {
                code: resp.code,
                reason: resp.reason,
                message: resp.message,
            }),
        }
    }
}

/// Why [`ResumableWatch::next`] stopped.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch cancelled")]
    Cancelled,

    #[error("watch error event: {0}")]
    Status(WatchStatus),

    #[error("failed to open watch: {0}")]
    Client(#[from] ClientError),
}

/// A watch that reopens itself from the last observed resource version.
pub struct ResumableWatch<K: ClusterResource, C: ?Sized> {
    client: Arc<C>,
    cluster: LogicalCluster,
    filter: ListFilter,
    last_resource_version: Option<String>,
    stream: Option<WatchStream<K>>,
    delivered_since_open: bool,
    resume_delay: Duration,
    restarts: u64,
}

impl<K, C> ResumableWatch<K, C>
where
    K: ClusterResource,
    C: ResourceClient<K> + ?Sized,
{
    /// Watch `cluster` starting after `resource_version`, usually the version
    /// returned by a preceding list.
    pub fn new(
        client: Arc<C>,
        cluster: LogicalCluster,
        filter: ListFilter,
        resource_version: Option<String>,
    ) -> Self {
        Self {
            client,
            cluster,
            filter,
            last_resource_version: resource_version,
            stream: None,
            delivered_since_open: false,
            resume_delay: Duration::from_millis(200),
            restarts: 0,
        }
    }

    /// Pause before reopening a stream that closed without delivering anything.
    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = delay;
        self
    }

    pub fn last_resource_version(&self) -> Option<&str> {
        self.last_resource_version.as_deref()
    }

    /// Number of times the stream was reopened after closing.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Next event, reopening the stream as often as needed.
    ///
    /// `Error` events are returned as [`WatchError::Status`]; the caller
    /// decides whether to relist or give up.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<WatchEvent<K>, WatchError> {
        loop {
            if cancel.is_cancelled() {
                return Err(WatchError::Cancelled);
            }

            if self.stream.is_none() {
                let opened = tokio::select! {
                    _ = cancel.cancelled() => return Err(WatchError::Cancelled),
                    opened = self.client.watch(
                        &self.cluster,
                        &self.filter,
                        self.last_resource_version.as_deref(),
                    ) => opened?,
                };
                debug!(
                    cluster = %self.cluster,
                    resource_version = ?self.last_resource_version,
                    kind = %K::kind(&()),
                    "Watch opened"
                );
                self.delivered_since_open = false;
                self.stream = Some(opened);
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };

            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(WatchError::Cancelled),
                item = stream.next() => item,
            };

            match item {
                Some(Ok(WatchEvent::Error(status))) => {
                    self.stream = None;
                    return Err(WatchError::Status(status));
                }
                Some(Ok(event)) => {
                    if let Some(rv) = event.resource_version() {
                        self.last_resource_version = Some(rv);
                    }
                    self.delivered_since_open = true;
                    return Ok(event);
                }
                Some(Err(e)) => {
                    warn!(
                        cluster = %self.cluster,
                        kind = %K::kind(&()),
                        error = %e,
                        "Watch stream failed, resuming"
                    );
                    self.reset();
                }
                None => {
                    debug!(
                        cluster = %self.cluster,
                        resource_version = ?self.last_resource_version,
                        kind = %K::kind(&()),
                        "Watch closed, resuming from last resource version"
                    );
                    self.reset();
                }
            }

            if !self.delivered_since_open && !self.resume_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WatchError::Cancelled),
                    _ = tokio::time::sleep(self.resume_delay) => {}
                }
            }
        }
    }

    fn reset(&mut self) {
        self.stream = None;
        self.restarts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryClient;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resumes_after_close_without_losing_events() {
        let client = Arc::new(MemoryClient::new());
        let cluster = LogicalCluster::new("root:a");
        let listing: crate::Listing<Namespace> =
            client.list(&cluster, &ListFilter::all()).await.unwrap();
        let cancel = CancellationToken::new();
        let mut watch: ResumableWatch<Namespace, MemoryClient> = ResumableWatch::new(
            client.clone(),
            cluster.clone(),
            ListFilter::all(),
            listing.resource_version,
        )
        .with_resume_delay(Duration::ZERO);

        client.create(&cluster, &namespace("one")).await.unwrap();
        let first = watch.next(&cancel).await.unwrap();
        assert_eq!(first.object().unwrap().name_any(), "one");
        let after_first = watch.last_resource_version().map(str::to_string);

        // Changes made while no stream is open must still arrive.
        client.close_watches();
        client.create(&cluster, &namespace("two")).await.unwrap();

        let second = watch.next(&cancel).await.unwrap();
        assert_eq!(second.object().unwrap().name_any(), "two");
        assert_eq!(watch.restarts(), 1);
        assert_ne!(watch.last_resource_version().map(str::to_string), after_first);
    }

    #[tokio::test]
    async fn test_error_event_is_surfaced() {
        let client = Arc::new(MemoryClient::new());
        let cancel = CancellationToken::new();
        let mut watch: ResumableWatch<Namespace, MemoryClient> = ResumableWatch::new(
            client.clone(),
            LogicalCluster::wildcard(),
            ListFilter::all(),
            Some(client.resource_version()),
        );

        let pending = tokio::spawn(async move { watch.next(&cancel).await });
        while client.watcher_count() == 0 {
            tokio::task::yield_now().await;
        }
        client.emit_watch_error(WatchStatus {
            code: 410,
            reason: "Expired".into(),
            message: "too old resource version".into(),
        });

        match pending.await.unwrap() {
            Err(WatchError::Status(status)) => assert_eq!(status.code, 410),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let client = Arc::new(MemoryClient::new());
        let cancel = CancellationToken::new();
        let mut watch: ResumableWatch<Namespace, MemoryClient> = ResumableWatch::new(
            client,
            LogicalCluster::empty(),
            ListFilter::all(),
            None,
        );
        cancel.cancel();
        assert!(matches!(watch.next(&cancel).await, Err(WatchError::Cancelled)));
    }
}
