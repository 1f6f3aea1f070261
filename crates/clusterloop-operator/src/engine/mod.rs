//! Reconciliation engine
//!
//! Trigger sources turn list and watch events into [`ClusterKey`]s on a
//! de-duplicating work queue; a pool of workers pops keys and runs the
//! registered [`Reconciler`]. A key is never reconciled by two workers at once,
//! distinct keys run concurrently.

mod controller;
mod queue;
mod source;

pub use controller::Controller;
pub use queue::WorkQueue;
pub use source::{controller_owner, Mapper};

use async_trait::async_trait;
use clusterloop_core::ClusterKey;
use std::time::Duration;

/// What to do with a key after a successful reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the next change.
    Done,
    /// Reconcile the key again after the delay, whatever else happens.
    RequeueAfter(Duration),
}

impl Action {
    pub fn await_change() -> Self {
        Action::Done
    }

    pub fn requeue(after: Duration) -> Self {
        Action::RequeueAfter(after)
    }
}

/// Classifies reconcile failures for the retry policy.
pub trait Retryable: std::error::Error + Send + Sync + 'static {
    /// Whether retrying can succeed without outside intervention.
    ///
    /// Reported in failure logs. Every failure is retried on the same
    /// exponential backoff, so a fixed cluster state is picked up.
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Business logic for one kind.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Error: Retryable;

    /// Controller name used in logs and metrics.
    const NAME: &'static str;

    /// Drive the object at `key` towards its desired state. Must be safe to
    /// call repeatedly with the same observed state.
    async fn reconcile(&self, key: &ClusterKey) -> Result<Action, Self::Error>;
}
