//! Logical cluster names and cluster-scoped object keys
//!
//! A kcp server partitions resources into logical clusters (workspaces). The
//! same `namespace/name` pair may exist once per logical cluster, so every
//! object is addressed by its cluster tag in addition to its namespace and name.

use kube::ResourceExt;
use std::fmt;

/// Annotation carrying the logical cluster of an object returned by a
/// wildcard list or watch.
pub const CLUSTER_ANNOTATION: &str = "kcp.dev/cluster";

/// Sentinel cluster name selecting every logical cluster.
pub const WILDCARD: &str = "*";

/// Name of a logical cluster.
///
/// Three shapes are meaningful:
/// - a concrete tenant, e.g. `root:org:team`
/// - empty, the default (ungrouped) view served at the base URL
/// - the wildcard `*`, selecting all tenants at once
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalCluster(String);

impl LogicalCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The default, ungrouped view.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Selector matching every logical cluster.
    pub fn wildcard() -> Self {
        Self(WILDCARD.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether an object tagged with `other` is visible through this selector.
    pub fn selects(&self, other: &LogicalCluster) -> bool {
        self.is_wildcard() || self == other
    }

    /// URL path prefix addressing this cluster on a kcp server.
    ///
    /// The empty cluster has no prefix and is served at the base URL.
    pub fn path_prefix(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(format!("/clusters/{}", self.0))
        }
    }
}

impl fmt::Display for LogicalCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogicalCluster {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for LogicalCluster {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Logical cluster an object belongs to, read from its annotations.
///
/// Objects without the annotation belong to the empty (ungrouped) view.
pub fn cluster_of<K: ResourceExt>(obj: &K) -> LogicalCluster {
    obj.annotations()
        .get(CLUSTER_ANNOTATION)
        .map(|c| LogicalCluster::new(c.as_str()))
        .unwrap_or_default()
}

/// Tag `obj` with `cluster`, or clear the tag for the empty view.
pub fn set_cluster<K: ResourceExt>(obj: &mut K, cluster: &LogicalCluster) {
    if cluster.is_empty() {
        obj.annotations_mut().remove(CLUSTER_ANNOTATION);
    } else {
        obj.annotations_mut()
            .insert(CLUSTER_ANNOTATION.to_string(), cluster.to_string());
    }
}

/// Identifies one object across all logical clusters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub cluster: LogicalCluster,
    pub namespace: Option<String>,
    pub name: String,
}

impl ClusterKey {
    pub fn new(
        cluster: impl Into<LogicalCluster>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.into(),
        }
    }

    /// Key of a namespaced object.
    pub fn namespaced(
        cluster: impl Into<LogicalCluster>,
        namespace: &str,
        name: impl Into<String>,
    ) -> Self {
        Self::new(cluster, Some(namespace), name)
    }

    /// Key of a cluster-scoped object such as a Namespace.
    pub fn cluster_scoped(cluster: impl Into<LogicalCluster>, name: impl Into<String>) -> Self {
        Self::new(cluster, None, name)
    }

    /// Key of an object as observed from a list or watch.
    pub fn from_object<K: ResourceExt>(obj: &K) -> Self {
        Self {
            cluster: cluster_of(obj),
            namespace: obj.namespace().filter(|ns| !ns.is_empty()),
            name: obj.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Key of a sibling object with a different name in the same cluster and
    /// namespace.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}|{}/{}", self.cluster, ns, self.name),
            None => write!(f, "{}|{}", self.cluster, self.name),
        }
    }
}
