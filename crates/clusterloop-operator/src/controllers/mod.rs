//! Cluster-aware controllers
//!
//! Reconcilers for ConfigMaps (with their owned Secrets) and Widgets. Every key
//! carries its logical cluster and every API call names it.

mod configmap;
mod context;
mod widget;

pub use configmap::{ConfigMapReconciler, OperationResult};
pub use context::{ClusterClient, Context};
pub use widget::WidgetReconciler;

use crate::engine::Retryable;
use clusterloop_core::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(
        "there should be only one ConfigMap named '{name}' in namespace '{namespace}' \
         without a logical cluster, found {count}"
    )]
    DuplicateUngrouped {
        namespace: String,
        name: String,
        count: usize,
    },

    #[error("{kind} {name} has no uid, cannot own dependents")]
    MissingUid { kind: &'static str, name: String },

    #[error("failed to compute patch: {0}")]
    Patch(#[from] serde_json::Error),
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::Client(e) if e.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Client(e) if e.is_conflict())
    }
}

impl Retryable for ReconcileError {
    fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::DuplicateUngrouped { .. })
    }
}
