mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use memory::InMemoryStore;

use crate::error::Result;
use crate::model::{ObjectKey, Resource, ResourceSpec};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Applied(ObjectKey),
    Deleted(ObjectKey),
}

impl WatchEvent {
    pub fn key(&self) -> &ObjectKey {
        match self {
            WatchEvent::Applied(key) | WatchEvent::Deleted(key) => key,
        }
    }
}

/// Persistence collaborator for one resource kind.
///
/// Writes are optimistic: `update` and `patch_status` fail with
/// [`Error::Conflict`](crate::Error::Conflict) when the stored
/// `resource_version` differs from the one the caller read.
#[async_trait]
pub trait Store<S: ResourceSpec>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Resource<S>>>;

    async fn list(&self) -> Result<Vec<Resource<S>>>;

    async fn create(&self, resource: Resource<S>) -> Result<Resource<S>>;

    /// Full update of metadata and spec. Status is left as stored.
    async fn update(&self, resource: &Resource<S>) -> Result<Resource<S>>;

    /// Merge the status difference between `original` and `modified`
    /// into the stored object.
    async fn patch_status(
        &self,
        original: &Resource<S>,
        modified: &Resource<S>,
    ) -> Result<Resource<S>>;

    /// Request deletion. Idempotent on missing objects.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
