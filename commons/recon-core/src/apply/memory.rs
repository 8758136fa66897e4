use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::trace;

use super::{Applier, Manifest};
use crate::error::{Error, Result};
use crate::graph::NodeId;

/// Write recorded by [`InMemoryCluster`], in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterOp {
    Applied(NodeId),
    Deleted(NodeId),
}

#[derive(Default)]
struct ClusterState {
    objects: HashMap<NodeId, Value>,
    not_ready: HashSet<NodeId>,
    failures: HashMap<NodeId, String>,
    history: Vec<ClusterOp>,
}

/// [`Applier`] keeping child objects in memory.
///
/// Objects are ready as soon as they exist unless marked otherwise with
/// [`set_ready`](Self::set_ready). [`fail_next`](Self::fail_next) makes the
/// next write to an id fail once with a retryable error.
#[derive(Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &NodeId) -> Option<Value> {
        self.state.read().await.objects.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.objects.is_empty()
    }

    pub async fn history(&self) -> Vec<ClusterOp> {
        self.state.read().await.history.clone()
    }

    pub async fn set_ready(&self, id: &NodeId, ready: bool) {
        let mut state = self.state.write().await;
        if ready {
            state.not_ready.remove(id);
        } else {
            state.not_ready.insert(id.clone());
        }
    }

    pub async fn fail_next(&self, id: &NodeId, message: impl Into<String>) {
        self.state
            .write()
            .await
            .failures
            .insert(id.clone(), message.into());
    }
}

#[async_trait]
impl Applier for InMemoryCluster {
    async fn apply(&self, manifest: &Manifest) -> Result<bool> {
        let mut state = self.state.write().await;
        if let Some(message) = state.failures.remove(&manifest.id) {
            return Err(Error::retryable(message));
        }
        if state.objects.get(&manifest.id) == Some(&manifest.body) {
            trace!(id = %manifest.id, "unchanged");
            return Ok(false);
        }
        state
            .objects
            .insert(manifest.id.clone(), manifest.body.clone());
        state.history.push(ClusterOp::Applied(manifest.id.clone()));
        Ok(true)
    }

    async fn delete(&self, id: &NodeId) -> Result<bool> {
        let mut state = self.state.write().await;
        if let Some(message) = state.failures.remove(id) {
            return Err(Error::retryable(message));
        }
        if state.objects.remove(id).is_none() {
            return Ok(false);
        }
        state.history.push(ClusterOp::Deleted(id.clone()));
        Ok(true)
    }

    async fn is_ready(&self, id: &NodeId) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.objects.contains_key(id) && !state.not_ready.contains(id))
    }
}
