//! Operator startup errors

use crate::resolver::ResolveError;
use clusterloop_core::ClientError;
use kube::config::{InferConfigError, KubeconfigError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    #[error("failed to infer cluster configuration: {0}")]
    InferConfig(#[from] InferConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("failed to resolve virtual workspace: {0}")]
    Resolve(#[from] ResolveError),

    #[error("{0} is not registered in the scheme")]
    NotRegistered(&'static str),

    #[error("API discovery failed: {0}")]
    Discovery(#[source] ClientError),

    #[error("startup cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
