//! APIExport (apis.kcp.dev/v1alpha1)
//!
//! Only the fields needed to locate an export's virtual workspace are
//! modelled. The type is owned by kcp and is never installed by this operator;
//! the derive is used for a typed client.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of kcp's APIs.
pub const KCP_APIS_GROUP: &str = "apis.kcp.dev";

/// Version of kcp's APIs this operator understands.
pub const KCP_APIS_VERSION: &str = "v1alpha1";

/// Condition set once the export's virtual workspace URLs are published.
pub const VIRTUAL_WORKSPACE_URLS_READY: &str = "VirtualWorkspaceURLsReady";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apis.kcp.dev",
    version = "v1alpha1",
    kind = "APIExport",
    root = "ApiExport",
    plural = "apiexports",
    status = "ApiExportStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportSpec {
    /// Names of the resource schemas exported, newest first, e.g.
    /// `v220801.widgets.data.my.domain`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub latest_resource_schemas: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_workspaces: Vec<VirtualWorkspace>,
}

/// kcp condition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VirtualWorkspace {
    pub url: String,
}

impl ApiExport {
    /// Whether condition `type_` is present with status `True`.
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
    }

    /// Published virtual workspace URLs, in server order.
    pub fn virtual_workspace_urls(&self) -> Vec<&str> {
        self.status
            .as_ref()
            .map(|s| s.virtual_workspaces.iter().map(|v| v.url.as_str()).collect())
            .unwrap_or_default()
    }

    /// Whether the first exported schema belongs to `group`.
    pub fn exports_group(&self, group: &str) -> bool {
        self.spec
            .latest_resource_schemas
            .first()
            .is_some_and(|schema| schema.ends_with(group))
    }
}

clusterloop_core::cluster_scoped_resource!(ApiExport, true);
