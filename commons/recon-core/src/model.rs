use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::status::ResourceStatus;

/// Desired-state payload of a reconciled resource kind.
pub trait ResourceSpec:
    Clone
    + fmt::Debug
    + PartialEq
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind name used in object keys, e.g. `Application`.
    const KIND: &'static str;
}

/// Identity of a reconciled resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<S: ResourceSpec>(
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(S::KIND, namespace, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: Option<String>,
    /// Bumped on every durable write; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped only when the spec changes.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Resource<S> {
    pub metadata: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl<S: ResourceSpec> Resource<S> {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: S,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            spec,
            status: ResourceStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            S::KIND,
            self.metadata.namespace.clone(),
            self.metadata.name.clone(),
        )
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, token: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == token)
    }
}
