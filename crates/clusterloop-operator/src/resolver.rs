//! Virtual workspace resolver
//!
//! An APIExport's virtual workspace URL is published asynchronously by kcp
//! once the export is first bound. The resolver lists the export, and when it
//! is not ready yet watches it until it is:
//!
//! ```text
//! Listing --ready--> Ready
//! Listing --absent or not ready--> Watching
//! Watching --ready event--> Ready
//! Watching --stream closed--> Watching (reopened from the last resource version)
//! Watching --error event, cancellation--> Aborted
//! ```

use crate::config::ResolverConfig;
use crate::crds::ApiExport;
use crate::observability::metrics::record_rewatch;
use backoff::future::retry;
use clusterloop_core::{
    ClientError, ListFilter, LogicalCluster, ResourceClient, ResumableWatch, WatchError,
    WatchEvent, WatchStatus,
};
use kube::ResourceExt;
use std::sync::Arc;
use strum::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ResolverState {
    Listing,
    Watching,
    Ready,
    Aborted,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("virtual workspace resolution cancelled")]
    Cancelled,

    #[error("APIExport watch failed: {0}")]
    WatchError(WatchStatus),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Finds the virtual workspace URL of an APIExport.
pub struct VirtualWorkspaceResolver<C: ?Sized> {
    client: Arc<C>,
    config: ResolverConfig,
    state: ResolverState,
    last_resource_version: Option<String>,
    rewatches: u64,
}

impl<C> VirtualWorkspaceResolver<C>
where
    C: ResourceClient<ApiExport> + ?Sized,
{
    pub fn new(client: Arc<C>, config: ResolverConfig) -> Self {
        Self {
            client,
            config,
            state: ResolverState::Listing,
            last_resource_version: None,
            rewatches: 0,
        }
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    /// Resource version the watch resumes from.
    pub fn last_resource_version(&self) -> Option<&str> {
        self.last_resource_version.as_deref()
    }

    /// Number of times the watch was reopened after closing.
    pub fn rewatches(&self) -> u64 {
        self.rewatches
    }

    fn filter(&self) -> ListFilter {
        if self.config.export_name.is_empty() {
            ListFilter::all()
        } else {
            ListFilter::named(&self.config.export_name)
        }
    }

    /// Whether `export` is the one this resolver waits for.
    fn accepts(&self, export: &ApiExport) -> bool {
        if self.config.export_name.is_empty() {
            export.exports_group(&self.config.group)
        } else {
            export.name_any() == self.config.export_name
        }
    }

    /// URL to use when `export` is accepted and ready.
    fn ready_url(&self, export: &ApiExport) -> Option<String> {
        if !self.accepts(export) {
            debug!(export = %export.name_any(), "Not this controller's APIExport");
            return None;
        }
        if !export.is_condition_true(&self.config.ready_condition) {
            info!(export = %export.name_any(), "APIExport virtual workspace URLs are not ready");
            return None;
        }
        // TODO: choose among several URLs once exports are sharded.
        let url = export.virtual_workspace_urls().first().map(|u| u.to_string());
        if url.is_none() {
            info!(export = %export.name_any(), "APIExport does not have any virtual workspace URLs");
        }
        url
    }

    fn abort(&mut self, err: ResolveError) -> ResolveError {
        warn!(error = %err, "Virtual workspace resolution aborted");
        self.state = ResolverState::Aborted;
        err
    }

    fn ready(&mut self, export: &ApiExport, url: String) -> String {
        info!(export = %export.name_any(), url = %url, "Using APIExport to configure client");
        self.state = ResolverState::Ready;
        url
    }

    /// Block until the export is ready and return its first URL.
    pub async fn resolve(&mut self, cancel: &CancellationToken) -> Result<String, ResolveError> {
        self.state = ResolverState::Listing;
        let filter = self.filter();
        info!(export = %self.config.export_name, "Listing APIExports");

        let listed = {
            let client = Arc::clone(&self.client);
            let cluster = LogicalCluster::empty();
            let (client, cluster, filter) = (client.as_ref(), &cluster, &filter);
            let attempt = retry(self.config.list_backoff.clone(), move || async move {
                client.list(cluster, filter).await.map_err(|e| match e {
                    ClientError::InvalidUrl(_) => backoff::Error::permanent(e),
                    e => {
                        warn!(error = %e, "Listing APIExports failed, retrying");
                        backoff::Error::transient(e)
                    }
                })
            });
            tokio::select! {
                _ = cancel.cancelled() => None,
                listed = attempt => Some(listed),
            }
        };
        let listing = match listed {
            Some(Ok(listing)) => listing,
            Some(Err(e)) => return Err(self.abort(e.into())),
            None => return Err(self.abort(ResolveError::Cancelled)),
        };
        for export in &listing.items {
            if let Some(url) = self.ready_url(export) {
                return Ok(self.ready(export, url));
            }
        }

        self.state = ResolverState::Watching;
        self.last_resource_version = listing.resource_version;
        info!(
            resource_version = ?self.last_resource_version,
            "No ready APIExport yet, watching"
        );
        let mut watch: ResumableWatch<ApiExport, C> = ResumableWatch::new(
            self.client.clone(),
            LogicalCluster::empty(),
            filter,
            self.last_resource_version.clone(),
        )
        .with_resume_delay(self.config.rewatch_delay);

        loop {
            let event = match watch.next(cancel).await {
                Ok(event) => event,
                Err(WatchError::Cancelled) => return Err(self.abort(ResolveError::Cancelled)),
                Err(WatchError::Status(status)) => {
                    return Err(self.abort(ResolveError::WatchError(status)))
                }
                Err(WatchError::Client(e)) => return Err(self.abort(e.into())),
            };

            self.last_resource_version = watch.last_resource_version().map(str::to_string);
            while self.rewatches < watch.restarts() {
                self.rewatches += 1;
                record_rewatch();
                info!(resource_version = ?self.last_resource_version, "APIExport watch re-established");
            }

            if let WatchEvent::Added(export) | WatchEvent::Modified(export) = &event {
                info!(export = %export.name_any(), event = event.type_name(), "APIExport event received");
                if let Some(url) = self.ready_url(export) {
                    return Ok(self.ready(export, url));
                }
            }
        }
    }
}
