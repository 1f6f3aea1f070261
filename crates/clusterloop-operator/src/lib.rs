//! Clusterloop Operator Library
//!
//! ConfigMap and Widget controllers that reconcile objects across kcp logical
//! clusters through an APIExport virtual workspace, or across a single plain
//! Kubernetes cluster when kcp is not present.

pub mod bootstrap;
pub mod config;
pub mod controllers;
pub mod crds;
pub mod engine;
pub mod error;
pub mod observability;
pub mod health;
pub mod resolver;

pub use crds::{ApiExport, Widget, WidgetSpec, WidgetStatus};
pub use error::{Error, Result};

use clusterloop_core::Scheme;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};

/// Every kind the operator reads or writes.
pub fn scheme() -> Scheme {
    Scheme::new()
        .register::<ConfigMap>()
        .register::<Secret>()
        .register::<Namespace>()
        .register::<Widget>()
        .register::<ApiExport>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_kinds() {
        let scheme = scheme();
        assert_eq!(scheme.kinds().len(), 5);
        assert_eq!(scheme.groups(), vec!["data.my.domain", "apis.kcp.dev"]);
        let export = scheme.lookup::<ApiExport>().unwrap();
        assert_eq!(export.kind, "APIExport");
        assert!(!export.namespaced);
        assert_eq!(scheme.lookup::<Widget>().unwrap().api_version(), "data.my.domain/v1alpha1");
    }
}
