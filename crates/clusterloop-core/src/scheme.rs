//! Registry of the resource kinds a process works with
//!
//! Built once at startup and handed by reference to whatever needs to know
//! which groups and kinds are served.

use crate::resource::ClusterResource;
use std::fmt;

/// Group, version and kind of one registered resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl KindInfo {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for KindInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Explicit type registry.
#[derive(Clone, Debug, Default)]
pub struct Scheme {
    kinds: Vec<KindInfo>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `K`; registering the same kind twice is a no-op.
    pub fn register<K: ClusterResource>(mut self) -> Self {
        let info = KindInfo {
            group: K::group(&()).to_string(),
            version: K::version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            plural: K::plural(&()).to_string(),
            namespaced: K::NAMESPACED,
        };
        if !self.kinds.contains(&info) {
            self.kinds.push(info);
        }
        self
    }

    pub fn kinds(&self) -> &[KindInfo] {
        &self.kinds
    }

    pub fn lookup<K: ClusterResource>(&self) -> Option<&KindInfo> {
        self.kinds
            .iter()
            .find(|k| k.kind == K::kind(&()) && k.group == K::group(&()))
    }

    /// Distinct non-core API groups, in registration order.
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for k in &self.kinds {
            if !k.group.is_empty() && !groups.contains(&k.group.as_str()) {
                groups.push(&k.group);
            }
        }
        groups
    }
}
