//! Widget controller
//!
//! Publishes the number of Widgets in a logical cluster into the status of
//! every Widget in that cluster.

use super::{ClusterClient, Context, ReconcileError};
use crate::config::EngineConfig;
use crate::crds::Widget;
use crate::engine::{Action, Controller, Reconciler};
use async_trait::async_trait;
use clusterloop_core::{ClusterKey, ListFilter, MergePatch};
use std::sync::Arc;
use tracing::{debug, info, instrument, Level};

pub struct WidgetReconciler<C> {
    ctx: Arc<Context<C>>,
}

impl<C: ClusterClient> WidgetReconciler<C> {
    pub fn new(ctx: Arc<Context<C>>) -> Self {
        Self { ctx }
    }

    pub fn controller(ctx: Arc<Context<C>>, config: EngineConfig) -> Controller<Self> {
        let client = ctx.client.clone();
        let clusters = ctx.all_clusters.clone();
        Controller::new(Arc::new(Self::new(ctx)), config).watches::<Widget, _>(client, clusters)
    }

    #[instrument(skip_all, fields(cluster = %key.cluster, namespace = ?key.namespace, name = %key.name))]
    async fn reconcile_widget(&self, key: &ClusterKey) -> Result<Action, ReconcileError> {
        let widgets = self.ctx.api::<Widget>();

        if tracing::enabled!(Level::DEBUG) {
            let all = widgets
                .list(&self.ctx.all_clusters, &ListFilter::all())
                .await?;
            debug!(count = all.items.len(), "Widgets across all clusters");
        }

        let widget = match widgets.get(key).await {
            Ok(w) => w,
            Err(e) if e.is_not_found() => {
                debug!("Widget was deleted");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        let total = widgets.list(&key.cluster, &ListFilter::all()).await?.items.len() as i64;
        if widget.total() == total {
            debug!(total, "Widget status already correct");
            return Ok(Action::await_change());
        }

        let mut updated = widget.clone();
        updated.status.get_or_insert_with(Default::default).total = total;
        let patch = MergePatch::diff(&widget, &updated)?;
        widgets.patch_status(key, &patch).await?;
        info!(total, "Patched widget status");
        Ok(Action::await_change())
    }
}

#[async_trait]
impl<C: ClusterClient> Reconciler for WidgetReconciler<C> {
    type Error = ReconcileError;
    const NAME: &'static str = "widget";

    async fn reconcile(&self, key: &ClusterKey) -> Result<Action, ReconcileError> {
        self.reconcile_widget(key).await
    }
}
