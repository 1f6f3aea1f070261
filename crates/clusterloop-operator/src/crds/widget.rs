//! Widget CRD
//!
//! A namespaced resource whose status republishes how many Widgets exist in
//! its logical cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group served by this controller's APIExport.
pub const GROUP: &str = "data.my.domain";

/// Widget is an example resource served through an APIExport.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "data.my.domain",
    version = "v1alpha1",
    kind = "Widget",
    namespaced,
    status = "WidgetStatus",
    printcolumn = r#"{"name":"Foo", "type":"string", "jsonPath":".spec.foo"}"#,
    printcolumn = r#"{"name":"Total", "type":"integer", "jsonPath":".status.total"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSpec {
    /// Free-form payload, not interpreted by the controller.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub foo: String,
}

/// Observed state of a Widget.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetStatus {
    /// Number of Widgets in the same logical cluster.
    #[serde(default)]
    pub total: i64,
}

impl Widget {
    /// Total currently published in the status, zero when unset.
    pub fn total(&self) -> i64 {
        self.status.as_ref().map_or(0, |s| s.total)
    }
}

clusterloop_core::namespaced_resource!(Widget, true);
