//! ConfigMap controller
//!
//! For each ConfigMap:
//! 1. answers `labels.name` with `labels.response = hello-<name>`
//! 2. checks that at most one ungrouped ConfigMap shares its namespace/name
//! 3. ensures the namespace named by `data.namespace` exists
//! 4. mirrors `data.secretData` into an owned Secret's `dataFromCM`

use super::{ClusterClient, Context, ReconcileError};
use crate::config::EngineConfig;
use crate::engine::{controller_owner, Action, Controller, Reconciler};
use async_trait::async_trait;
use clusterloop_core::{cluster_of, ClusterKey, ListFilter, MergePatch};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::Display;
use tracing::{debug, info, instrument};

const NAME_LABEL: &str = "name";
const RESPONSE_LABEL: &str = "response";
const NAMESPACE_KEY: &str = "namespace";
const SECRET_DATA_KEY: &str = "secretData";
const SECRET_FIELD: &str = "dataFromCM";

/// Outcome of a create-or-patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

pub struct ConfigMapReconciler<C> {
    ctx: Arc<Context<C>>,
}

impl<C: ClusterClient> ConfigMapReconciler<C> {
    pub fn new(ctx: Arc<Context<C>>) -> Self {
        Self { ctx }
    }

    /// Controller for ConfigMaps, also triggered by changes to the Secrets
    /// they own.
    pub fn controller(ctx: Arc<Context<C>>, config: EngineConfig) -> Controller<Self> {
        let client = ctx.client.clone();
        let clusters = ctx.all_clusters.clone();
        Controller::new(Arc::new(Self::new(ctx)), config)
            .watches::<ConfigMap, _>(client.clone(), clusters.clone())
            .watches_with::<Secret, _>(client, clusters, Arc::new(controller_owner::<ConfigMap, Secret>))
    }

    #[instrument(skip_all, fields(cluster = %key.cluster, namespace = ?key.namespace, name = %key.name))]
    async fn reconcile_config_map(&self, key: &ClusterKey) -> Result<Action, ReconcileError> {
        let config_maps = self.ctx.api::<ConfigMap>();
        let mut cm = match config_maps.get(key).await {
            Ok(cm) => cm,
            Err(e) if e.is_not_found() => {
                debug!("ConfigMap no longer exists");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(response) = desired_response(&cm) {
            cm.labels_mut().insert(RESPONSE_LABEL.to_string(), response);
            config_maps.update(&key.cluster, &cm).await?;
            info!("Updated response label");
            // The update triggers another pass for the remaining steps.
            return Ok(Action::await_change());
        }

        let listing = config_maps
            .list(&self.ctx.all_clusters, &ListFilter::all())
            .await?;
        debug!(count = listing.items.len(), "Listed ConfigMaps in all clusters");
        ensure_single_ungrouped(&listing.items, key)?;

        let data = cm.data.clone().unwrap_or_default();

        if let Some(ns) = data.get(NAMESPACE_KEY).filter(|ns| !ns.is_empty()) {
            if let Some(action) = self.ensure_namespace(key, ns).await? {
                return Ok(action);
            }
        }

        if let Some(payload) = data.get(SECRET_DATA_KEY) {
            let result = self.apply_secret(key, &cm, payload).await?;
            info!(secret = %key.name, result = %result, "Secret synced");
        }

        Ok(Action::await_change())
    }

    /// Create namespace `ns` in the key's cluster if missing. Returns the
    /// requeue to wait for it after a create.
    async fn ensure_namespace(
        &self,
        key: &ClusterKey,
        ns: &str,
    ) -> Result<Option<Action>, ReconcileError> {
        let namespaces = self.ctx.api::<Namespace>();
        let ns_key = ClusterKey::cluster_scoped(key.cluster.clone(), ns);
        match namespaces.get(&ns_key).await {
            Ok(_) => {
                debug!(namespace = %ns, "Namespace exists");
                Ok(None)
            }
            Err(e) if e.is_not_found() => {
                let namespace = Namespace {
                    metadata: ObjectMeta {
                        name: Some(ns.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match namespaces.create(&key.cluster, &namespace).await {
                    Ok(_) => {
                        info!(namespace = %ns, "Created namespace");
                        Ok(Some(Action::requeue(self.ctx.namespace_requeue)))
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!(namespace = %ns, "Namespace created concurrently");
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create the Secret mirroring `payload`, or patch its `dataFromCM` when
    /// it exists. Other fields of an existing Secret are left alone.
    async fn apply_secret(
        &self,
        key: &ClusterKey,
        cm: &ConfigMap,
        payload: &str,
    ) -> Result<OperationResult, ReconcileError> {
        let secrets = self.ctx.api::<Secret>();
        let value = ByteString(payload.as_bytes().to_vec());

        let existing = match secrets.get(key).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                let owner = cm
                    .controller_owner_ref(&())
                    .ok_or_else(|| ReconcileError::MissingUid {
                        kind: "ConfigMap",
                        name: cm.name_any(),
                    })?;
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(key.name.clone()),
                        namespace: key.namespace.clone(),
                        owner_references: Some(vec![owner]),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(SECRET_FIELD.to_string(), value)])),
                    ..Default::default()
                };
                secrets.create(&key.cluster, &secret).await?;
                return Ok(OperationResult::Created);
            }
            Err(e) => return Err(e.into()),
        };

        let mut desired = existing.clone();
        desired
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(SECRET_FIELD.to_string(), value);
        let patch = MergePatch::diff(&existing, &desired)?;
        if patch.is_empty() {
            return Ok(OperationResult::Unchanged);
        }
        secrets.patch(key, &patch).await?;
        Ok(OperationResult::Updated)
    }
}

#[async_trait]
impl<C: ClusterClient> Reconciler for ConfigMapReconciler<C> {
    type Error = ReconcileError;
    const NAME: &'static str = "configmap";

    async fn reconcile(&self, key: &ClusterKey) -> Result<Action, ReconcileError> {
        self.reconcile_config_map(key).await
    }
}

/// The `response` label `cm` should carry, when it differs from the current one.
pub fn desired_response(cm: &ConfigMap) -> Option<String> {
    let name = cm.labels().get(NAME_LABEL).filter(|n| !n.is_empty())?;
    let response = format!("hello-{name}");
    (cm.labels().get(RESPONSE_LABEL) != Some(&response)).then_some(response)
}

/// Fails when more than one ungrouped ConfigMap in `items` has the key's
/// namespace and name.
pub fn ensure_single_ungrouped(items: &[ConfigMap], key: &ClusterKey) -> Result<(), ReconcileError> {
    let count = items
        .iter()
        .filter(|cm| {
            cluster_of(*cm).is_empty()
                && cm.namespace().as_deref() == key.namespace()
                && cm.name_any() == key.name
        })
        .count();
    if count > 1 {
        return Err(ReconcileError::DuplicateUngrouped {
            namespace: key.namespace.clone().unwrap_or_default(),
            name: key.name.clone(),
            count,
        });
    }
    Ok(())
}
