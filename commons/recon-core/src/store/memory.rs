use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::trace;

use super::{Store, WatchEvent};
use crate::error::{Error, Result};
use crate::model::{ObjectKey, Resource, ResourceSpec};
use crate::patch::{apply_merge_patch, status_patch};

const EVENT_BUFFER: usize = 1024;

/// Process-local [`Store`] with the same revision and deletion semantics
/// as an API server: deletion of an object carrying finalizers only sets
/// its deletion marker; the object goes away once the last finalizer is
/// removed.
pub struct InMemoryStore<S> {
    objects: RwLock<HashMap<ObjectKey, Resource<S>>>,
    events: broadcast::Sender<WatchEvent>,
    next_uid: AtomicU64,
}

impl<S: ResourceSpec> InMemoryStore<S> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            objects: RwLock::new(HashMap::new()),
            events,
            next_uid: AtomicU64::new(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn notify(&self, event: WatchEvent) {
        trace!(?event, "store event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl<S: ResourceSpec> Default for InMemoryStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_revision<S: ResourceSpec>(
    stored: &Resource<S>,
    expected: u64,
) -> Result<()> {
    if stored.metadata.resource_version != expected {
        return Err(Error::Conflict {
            key: stored.key(),
            expected,
            found: stored.metadata.resource_version,
        });
    }
    Ok(())
}

#[async_trait]
impl<S: ResourceSpec> Store<S> for InMemoryStore<S> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Resource<S>>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<Resource<S>>> {
        let mut all: Vec<Resource<S>> =
            self.objects.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.key());
        Ok(all)
    }

    async fn create(&self, mut resource: Resource<S>) -> Result<Resource<S>> {
        let key = resource.key();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists(key));
        }
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        resource.metadata.uid = Some(format!("{uid:016x}"));
        resource.metadata.resource_version = 1;
        resource.metadata.generation = 1;
        resource.metadata.deletion_timestamp = None;
        objects.insert(key.clone(), resource.clone());
        drop(objects);
        self.notify(WatchEvent::Applied(key));
        Ok(resource)
    }

    async fn update(&self, resource: &Resource<S>) -> Result<Resource<S>> {
        let key = resource.key();
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get(&key) else {
            return Err(Error::NotFound(key));
        };
        check_revision(stored, resource.metadata.resource_version)?;

        let mut next = resource.clone();
        next.status = stored.status.clone();
        next.metadata.uid = stored.metadata.uid.clone();
        // The deletion marker can't be set or cleared through an update.
        next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
        next.metadata.resource_version = stored.metadata.resource_version + 1;
        next.metadata.generation = if next.spec != stored.spec {
            stored.metadata.generation + 1
        } else {
            stored.metadata.generation
        };

        if next.is_deleting() && next.metadata.finalizers.is_empty() {
            objects.remove(&key);
            drop(objects);
            self.notify(WatchEvent::Deleted(key));
        } else {
            objects.insert(key.clone(), next.clone());
            drop(objects);
            self.notify(WatchEvent::Applied(key));
        }
        Ok(next)
    }

    async fn patch_status(
        &self,
        original: &Resource<S>,
        modified: &Resource<S>,
    ) -> Result<Resource<S>> {
        let key = original.key();
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(&key) else {
            return Err(Error::NotFound(key));
        };
        check_revision(stored, original.metadata.resource_version)?;
        let Some(patch) = status_patch(original, modified)? else {
            return Ok(stored.clone());
        };

        let mut doc = serde_json::json!({
            "status": serde_json::to_value(&stored.status)?
        });
        apply_merge_patch(&mut doc, &patch);
        let status = doc
            .get_mut("status")
            .map(serde_json::Value::take)
            .unwrap_or_default();
        stored.status = serde_json::from_value(status)?;
        stored.metadata.resource_version += 1;
        let next = stored.clone();
        drop(objects);
        self.notify(WatchEvent::Applied(key));
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(key) else {
            return Ok(());
        };
        if stored.metadata.finalizers.is_empty() {
            objects.remove(key);
            drop(objects);
            self.notify(WatchEvent::Deleted(key.clone()));
        } else if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Utc::now());
            stored.metadata.resource_version += 1;
            drop(objects);
            self.notify(WatchEvent::Applied(key.clone()));
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
