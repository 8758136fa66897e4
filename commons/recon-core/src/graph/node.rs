use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a node in a dependency graph.
///
/// Two nodes with equal ids are the same node, whatever object carries them.
/// The kind is stored lowercased so `ConfigMap` and `configmap` collide.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct NodeId {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl NodeId {
    /// Build from an `apiVersion` string (`apps/v1` or core `v1`).
    pub fn new(
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_ascii_lowercase(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Flat string key used to index the arena.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.group, self.version, self.kind, self.namespace, self.name
        )
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", self.api_version(), self.kind, self.name)
        } else {
            write!(
                f,
                "{}/{} {}/{}",
                self.api_version(),
                self.kind,
                self.namespace,
                self.name
            )
        }
    }
}

/// Anything that can be placed in a dependency graph.
pub trait DependencyNode {
    fn node_id(&self) -> NodeId;
}

impl DependencyNode for NodeId {
    fn node_id(&self) -> NodeId {
        self.clone()
    }
}

pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}
