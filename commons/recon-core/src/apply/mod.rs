//! Ordered apply and delete of batches of generated child objects.

mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use memory::{ClusterOp, InMemoryCluster};

use crate::error::{Error, Result};
use crate::graph::{DependencyNode, DependencyResolver, NodeId};

/// A generated child object plus what it needs to exist first.
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    pub id: NodeId,
    pub body: Value,
    pub depends_on: Vec<NodeId>,
}

impl Manifest {
    /// Parse identity from `apiVersion`, `kind` and `metadata`. Objects
    /// without a namespace get `default_namespace` written into the body.
    pub fn from_value(
        mut body: Value,
        default_namespace: &str,
    ) -> Result<Self> {
        let api_version = required_str(&body, &["apiVersion"])?;
        let kind = required_str(&body, &["kind"])?;
        let name = required_str(&body, &["metadata", "name"])?;
        let namespace = match body
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
        {
            Some(ns) => ns.to_string(),
            None => {
                if let Some(meta) = body
                    .get_mut("metadata")
                    .and_then(Value::as_object_mut)
                {
                    meta.insert(
                        "namespace".into(),
                        Value::String(default_namespace.to_string()),
                    );
                }
                default_namespace.to_string()
            }
        };
        Ok(Self {
            id: NodeId::new(&api_version, &kind, &namespace, &name),
            body,
            depends_on: Vec::new(),
        })
    }

    pub fn with_dependencies(
        mut self,
        deps: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        self.depends_on.extend(deps);
        self
    }
}

impl DependencyNode for Manifest {
    fn node_id(&self) -> NodeId {
        self.id.clone()
    }
}

fn required_str(body: &Value, path: &[&str]) -> Result<String> {
    let mut cur = body;
    for seg in path {
        cur = cur.get(seg).ok_or_else(|| missing(path))?;
    }
    cur.as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| missing(path))
}

fn missing(path: &[&str]) -> Error {
    Error::critical(format!("manifest is missing `{}`", path.join(".")))
}

/// Collaborator that owns the child objects (an API server, a helm
/// release, a fake).
#[async_trait]
pub trait Applier: Send + Sync {
    /// Create or update. Returns whether the stored object changed.
    async fn apply(&self, manifest: &Manifest) -> Result<bool>;

    /// Delete; missing objects are not an error. Returns whether
    /// something was removed.
    async fn delete(&self, id: &NodeId) -> Result<bool>;

    async fn is_ready(&self, id: &NodeId) -> Result<bool>;
}

/// Resolve apply order for a batch.
///
/// Duplicate ids are user input here, not a programming error, so they are
/// reported as a critical error before the resolver ever sees them.
pub fn plan_batch(manifests: Vec<Manifest>) -> Result<Vec<Manifest>> {
    let mut seen = HashSet::new();
    for m in &manifests {
        if !seen.insert(m.id.key()) {
            return Err(Error::critical(format!(
                "manifest {} declared more than once",
                m.id
            )));
        }
    }
    let mut resolver = DependencyResolver::new();
    for m in manifests {
        let deps = m.depends_on.clone();
        resolver.add_node(m, deps);
    }
    Ok(resolver.resolve()?)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Ids in the order they were processed.
    pub processed: Vec<NodeId>,
    /// How many of them actually changed.
    pub changed: usize,
}

/// Apply a batch in dependency order. Nothing is applied when the batch
/// can't be ordered.
pub async fn apply_batch(
    applier: &dyn Applier,
    manifests: Vec<Manifest>,
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let ordered = plan_batch(manifests)?;
    apply_ordered(applier, &ordered, cancel).await
}

/// Apply manifests already ordered by [`plan_batch`].
pub async fn apply_ordered(
    applier: &dyn Applier,
    ordered: &[Manifest],
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let mut report = BatchReport::default();
    for m in ordered {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if applier.apply(m).await? {
            debug!(id = %m.id, "applied");
            report.changed += 1;
        }
        report.processed.push(m.id.clone());
    }
    if report.changed > 0 {
        info!(
            total = ordered.len(),
            changed = report.changed,
            "batch applied"
        );
    }
    Ok(report)
}

/// Delete a batch in reverse dependency order.
pub async fn delete_batch(
    applier: &dyn Applier,
    manifests: Vec<Manifest>,
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let ordered = plan_batch(manifests)?;
    let mut report = BatchReport::default();
    for m in ordered.iter().rev() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if applier.delete(&m.id).await? {
            debug!(id = %m.id, "deleted");
            report.changed += 1;
        }
        report.processed.push(m.id.clone());
    }
    if report.changed > 0 {
        info!(
            total = ordered.len(),
            changed = report.changed,
            "batch deleted"
        );
    }
    Ok(report)
}

/// Delete every recorded id that is not in `keep`, newest first.
///
/// `inventory` is in apply order, so walking it backwards removes
/// dependents before what they depend on.
pub async fn prune(
    applier: &dyn Applier,
    inventory: &[NodeId],
    keep: &[NodeId],
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let mut report = BatchReport::default();
    for id in inventory.iter().rev().filter(|id| !keep.contains(id)) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if applier.delete(id).await? {
            debug!(%id, "pruned");
            report.changed += 1;
        }
        report.processed.push(id.clone());
    }
    if report.changed > 0 {
        info!(changed = report.changed, "stale objects pruned");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::graph::GraphError;

    fn cm(name: &str) -> Manifest {
        Manifest::from_value(
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name}
            }),
            "apps",
        )
        .unwrap()
    }

    #[test]
    fn from_value_fills_namespace() {
        let m = cm("cfg");
        assert_eq!(m.id, NodeId::new("v1", "ConfigMap", "apps", "cfg"));
        assert_eq!(m.body["metadata"]["namespace"], "apps");
    }

    #[test]
    fn from_value_rejects_incomplete_objects() {
        let err = Manifest::from_value(json!({"kind": "ConfigMap"}), "ns")
            .unwrap_err();
        assert!(err.is_critical());
        assert!(err.to_string().contains("apiVersion"));

        let err = Manifest::from_value(
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}}),
            "ns",
        )
        .unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn duplicate_manifests_are_a_critical_error() {
        let err = plan_batch(vec![cm("a"), cm("a")]).unwrap_err();
        assert!(err.is_critical());
        assert!(err.to_string().contains("more than once"));
    }

    #[tokio::test]
    async fn apply_follows_dependencies_and_delete_reverses() {
        let cluster = InMemoryCluster::new();
        let ns = cm("ns-config");
        let db = cm("db").with_dependencies([ns.id.clone()]);
        let app = cm("app").with_dependencies([db.id.clone(), ns.id.clone()]);
        let batch = vec![app.clone(), db.clone(), ns.clone()];
        let cancel = CancellationToken::new();

        let report =
            apply_batch(&cluster, batch.clone(), &cancel).await.unwrap();
        assert_eq!(
            report.processed,
            vec![ns.id.clone(), db.id.clone(), app.id.clone()]
        );
        assert_eq!(report.changed, 3);

        // Re-applying an unchanged batch is a no-op.
        let report =
            apply_batch(&cluster, batch.clone(), &cancel).await.unwrap();
        assert_eq!(report.changed, 0);

        let report = delete_batch(&cluster, batch, &cancel).await.unwrap();
        assert_eq!(
            report.processed,
            vec![app.id.clone(), db.id.clone(), ns.id.clone()]
        );
        assert_eq!(
            cluster.history().await,
            vec![
                ClusterOp::Applied(ns.id.clone()),
                ClusterOp::Applied(db.id.clone()),
                ClusterOp::Applied(app.id.clone()),
                ClusterOp::Deleted(app.id),
                ClusterOp::Deleted(db.id),
                ClusterOp::Deleted(ns.id),
            ]
        );
    }

    #[tokio::test]
    async fn prune_removes_unkept_ids_newest_first() {
        let cluster = InMemoryCluster::new();
        let cancel = CancellationToken::new();
        let (a, b, c) = (cm("a"), cm("b"), cm("c"));
        let batch = vec![a.clone(), b.clone(), c.clone()];
        let applied = apply_batch(&cluster, batch, &cancel).await.unwrap();

        let report =
            prune(&cluster, &applied.processed, &[b.id.clone()], &cancel)
                .await
                .unwrap();
        assert_eq!(report.processed, vec![c.id.clone(), a.id.clone()]);
        assert_eq!(report.changed, 2);
        assert!(cluster.get(&b.id).await.is_some());
        assert_eq!(cluster.len().await, 1);

        // Already gone: visited again, nothing removed.
        let report =
            prune(&cluster, &applied.processed, &[b.id.clone()], &cancel)
                .await
                .unwrap();
        assert_eq!(report.changed, 0);
    }

    #[tokio::test]
    async fn cyclic_batch_applies_nothing() {
        let cluster = InMemoryCluster::new();
        let b_id = NodeId::new("v1", "ConfigMap", "apps", "b");
        let a = cm("a").with_dependencies([b_id]);
        let b = cm("b").with_dependencies([a.id.clone()]);
        let free = cm("free");
        let err =
            apply_batch(&cluster, vec![free, a, b], &CancellationToken::new())
                .await
                .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::Cycle { .. })));
        assert!(err.is_critical());
        assert!(cluster.history().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_batch_stops_early() {
        let cluster = InMemoryCluster::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = apply_batch(&cluster, vec![cm("a")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(cluster.history().await.is_empty());
    }
}
