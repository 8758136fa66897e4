//! Helm-style applications: a set of child manifests applied in dependency
//! order, torn down in reverse. Applied children are recorded in the status
//! inventory so that ones dropped from the spec are pruned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recon_core::apply::{
    Applier, Manifest, apply_batch, apply_ordered, delete_batch, plan_batch,
    prune,
};
use recon_core::graph::NodeId;
use recon_core::{
    EnsureStep, Error, Outcome, Pipeline, PipelineBuilder, ReconcileContext,
    Resource, ResourceSpec, Status,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Poll interval while children are coming up.
const READY_POLL: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default)]
    pub manifests: Vec<ManifestSpec>,
    /// Objects applied right before teardown, e.g. a backup job.
    #[serde(default)]
    pub pre_delete_hooks: Vec<Value>,
}

impl ResourceSpec for ApplicationSpec {
    const KIND: &'static str = "Application";
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSpec {
    pub object: Value,
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Defaults to the application's namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl DependencyRef {
    fn node_id(&self, default_namespace: &str) -> NodeId {
        NodeId::new(
            &self.api_version,
            &self.kind,
            self.namespace.as_deref().unwrap_or(default_namespace),
            &self.name,
        )
    }
}

impl ApplicationSpec {
    pub fn manifests(&self, namespace: &str) -> Result<Vec<Manifest>, Error> {
        self.manifests
            .iter()
            .map(|m| {
                let deps = m.depends_on.iter().map(|d| d.node_id(namespace));
                Ok(Manifest::from_value(m.object.clone(), namespace)?
                    .with_dependencies(deps))
            })
            .collect()
    }

    pub fn hooks(&self, namespace: &str) -> Result<Vec<Manifest>, Error> {
        self.pre_delete_hooks
            .iter()
            .map(|h| Manifest::from_value(h.clone(), namespace))
            .collect()
    }
}

type Ctx = ReconcileContext<ApplicationSpec>;

pub struct ApplicationController {
    applier: Arc<dyn Applier>,
}

impl ApplicationController {
    pub fn new(applier: Arc<dyn Applier>) -> Self {
        Self { applier }
    }
}

impl PipelineBuilder<ApplicationSpec> for ApplicationController {
    fn ensure_pipeline(
        &self,
        _resource: &Resource<ApplicationSpec>,
    ) -> Pipeline<Ctx> {
        Pipeline::new()
            .step(ApplyManifests(self.applier.clone()))
            .step(AwaitReady(self.applier.clone()))
    }

    fn cleanup_pipeline(
        &self,
        _resource: &Resource<ApplicationSpec>,
    ) -> Pipeline<Ctx> {
        Pipeline::new()
            .step(PreDeleteHooks(self.applier.clone()))
            .step(DeleteManifests(self.applier.clone()))
    }
}

struct ApplyManifests(Arc<dyn Applier>);

#[async_trait]
impl EnsureStep<Ctx> for ApplyManifests {
    fn name(&self) -> &str {
        "apply-manifests"
    }

    async fn ensure(&self, ctx: &mut Ctx) -> Result<Outcome, Error> {
        let res = &ctx.resource;
        let ordered = plan_batch(res.spec.manifests(res.namespace())?)?;
        let current: Vec<NodeId> =
            ordered.iter().map(|m| m.id.clone()).collect();
        let previous = res.status.inventory.clone();

        // Recorded before applying so a partial apply is still tracked.
        ctx.resource.status.extend_inventory(&current);
        let report =
            apply_ordered(self.0.as_ref(), &ordered, &ctx.cancel).await?;
        let pruned =
            prune(self.0.as_ref(), &previous, &current, &ctx.cancel).await?;
        if pruned.changed > 0 {
            debug!(pruned = ?pruned.processed, "dropped children removed");
        }
        ctx.resource.status.inventory = current;
        ctx.resource.status.set_component(
            "manifests",
            Status::Success,
            format!("{} objects applied", report.processed.len()),
        );
        Ok(Outcome::Continue)
    }
}

struct AwaitReady(Arc<dyn Applier>);

#[async_trait]
impl EnsureStep<Ctx> for AwaitReady {
    fn name(&self) -> &str {
        "await-ready"
    }

    async fn ensure(&self, ctx: &mut Ctx) -> Result<Outcome, Error> {
        let res = &ctx.resource;
        let mut waiting = Vec::new();
        for m in res.spec.manifests(res.namespace())? {
            if !self.0.is_ready(&m.id).await? {
                waiting.push(m.id.to_string());
            }
        }
        if waiting.is_empty() {
            ctx.resource.status.set_component(
                "readiness",
                Status::Success,
                "all objects ready",
            );
            return Ok(Outcome::Continue);
        }
        debug!(?waiting, "children not ready yet");
        ctx.resource.status.set_component(
            "readiness",
            Status::Pending,
            format!("waiting for {}", waiting.join(", ")),
        );
        Ok(Outcome::RequeueAfter(READY_POLL))
    }
}

struct PreDeleteHooks(Arc<dyn Applier>);

#[async_trait]
impl EnsureStep<Ctx> for PreDeleteHooks {
    fn name(&self) -> &str {
        "pre-delete-hooks"
    }

    async fn ensure(&self, ctx: &mut Ctx) -> Result<Outcome, Error> {
        let res = &ctx.resource;
        let hooks = res.spec.hooks(res.namespace())?;
        if hooks.is_empty() {
            return Ok(Outcome::Continue);
        }
        apply_batch(self.0.as_ref(), hooks, &ctx.cancel).await?;
        ctx.resource.status.set_component(
            "hooks",
            Status::Success,
            "pre-delete hooks applied",
        );
        Ok(Outcome::Continue)
    }
}

struct DeleteManifests(Arc<dyn Applier>);

#[async_trait]
impl EnsureStep<Ctx> for DeleteManifests {
    fn name(&self) -> &str {
        "delete-manifests"
    }

    async fn ensure(&self, ctx: &mut Ctx) -> Result<Outcome, Error> {
        let res = &ctx.resource;
        let mut all = res.spec.manifests(res.namespace())?;
        all.extend(res.spec.hooks(res.namespace())?);
        let inventory = res.status.inventory.clone();
        let listed = delete_batch(self.0.as_ref(), all, &ctx.cancel).await?;
        // Children applied under an older spec.
        let recorded = prune(
            self.0.as_ref(),
            &inventory,
            &listed.processed,
            &ctx.cancel,
        )
        .await?;
        ctx.resource.status.inventory.clear();
        ctx.resource.status.set_component(
            "manifests",
            Status::Deleting,
            format!("{} objects removed", listed.changed + recorded.changed),
        );
        Ok(Outcome::Continue)
    }
}
