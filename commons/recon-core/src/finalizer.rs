use tracing::info;

use crate::error::Result;
use crate::model::{Resource, ResourceSpec};
use crate::store::Store;

/// Guards deletion of resources behind a cleanup token.
///
/// Both [`add`](Self::add) and [`remove`](Self::remove) are durable full
/// updates; the in-memory copy the caller holds is stale afterwards and the
/// invocation should requeue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizerManager {
    token: String,
}

impl FinalizerManager {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Live resource that does not carry our token yet.
    pub fn need_to_add<S: ResourceSpec>(&self, resource: &Resource<S>) -> bool {
        !resource.is_deleting() && !resource.has_finalizer(&self.token)
    }

    /// Resource marked for deletion that still waits on our cleanup.
    pub fn is_deletion_candidate<S: ResourceSpec>(
        &self,
        resource: &Resource<S>,
    ) -> bool {
        resource.is_deleting() && resource.has_finalizer(&self.token)
    }

    pub async fn add<S: ResourceSpec>(
        &self,
        store: &dyn Store<S>,
        resource: &Resource<S>,
    ) -> Result<Resource<S>> {
        let mut next = resource.clone();
        if !next.has_finalizer(&self.token) {
            next.metadata.finalizers.push(self.token.clone());
        }
        info!(key = %resource.key(), token = %self.token, "adding finalizer");
        store.update(&next).await
    }

    pub async fn remove<S: ResourceSpec>(
        &self,
        store: &dyn Store<S>,
        resource: &Resource<S>,
    ) -> Result<Resource<S>> {
        let mut next = resource.clone();
        next.metadata.finalizers.retain(|f| f != &self.token);
        info!(key = %resource.key(), token = %self.token, "removing finalizer");
        store.update(&next).await
    }
}
