use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use recon_core::graph::NodeId;
use recon_core::{
    EnsureStep, Error, Outcome, Pipeline, PipelineBuilder, ReconcileContext,
    Resource, ResourceSpec, Status,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Globally unique; claimed on behalf of `tenant`.
    pub project_id: String,
    pub tenant: String,
    #[serde(default)]
    pub billing_account: Option<String>,
}

impl ResourceSpec for ProjectSpec {
    const KIND: &'static str = "Project";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    /// Newly claimed, or already ours.
    Owned,
    /// Held by another tenant.
    Taken { tenant: String },
}

/// External system of record for project ids.
#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    async fn claim(
        &self,
        project_id: &str,
        tenant: &str,
    ) -> Result<Claim, Error>;

    /// Point the project at `account` (or none). Returns whether anything
    /// changed.
    async fn link_billing(
        &self,
        project_id: &str,
        account: Option<&str>,
    ) -> Result<bool, Error>;

    /// Release the id if `tenant` holds it. Returns whether it was held.
    async fn release(
        &self,
        project_id: &str,
        tenant: &str,
    ) -> Result<bool, Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectRecord {
    pub tenant: String,
    pub billing_account: Option<String>,
}

#[derive(Default)]
pub struct InMemoryProjectRegistry {
    projects: RwLock<HashMap<String, ProjectRecord>>,
}

impl InMemoryProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, project_id: &str) -> Option<ProjectRecord> {
        self.projects.read().await.get(project_id).cloned()
    }
}

#[async_trait]
impl ProjectRegistry for InMemoryProjectRegistry {
    async fn claim(
        &self,
        project_id: &str,
        tenant: &str,
    ) -> Result<Claim, Error> {
        let mut projects = self.projects.write().await;
        let record = projects
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectRecord {
                tenant: tenant.to_string(),
                billing_account: None,
            });
        if record.tenant == tenant {
            Ok(Claim::Owned)
        } else {
            Ok(Claim::Taken {
                tenant: record.tenant.clone(),
            })
        }
    }

    async fn link_billing(
        &self,
        project_id: &str,
        account: Option<&str>,
    ) -> Result<bool, Error> {
        let mut projects = self.projects.write().await;
        let Some(record) = projects.get_mut(project_id) else {
            return Err(Error::retryable(format!(
                "project {project_id} is not claimed yet"
            )));
        };
        if record.billing_account.as_deref() == account {
            return Ok(false);
        }
        record.billing_account = account.map(str::to_string);
        Ok(true)
    }

    async fn release(
        &self,
        project_id: &str,
        tenant: &str,
    ) -> Result<bool, Error> {
        let mut projects = self.projects.write().await;
        let held = projects
            .get(project_id)
            .is_some_and(|record| record.tenant == tenant);
        if held {
            projects.remove(project_id);
        }
        Ok(held)
    }
}

type Ctx = ReconcileContext<ProjectSpec>;

/// Inventory entry for a claim. The tenant sits in the namespace slot so
/// that a claim can be released after the spec moved on.
fn claim_ref(project_id: &str, tenant: &str) -> NodeId {
    NodeId::new("registry/v1", "ProjectClaim", tenant, project_id)
}

pub struct ProjectController {
    registry: Arc<dyn ProjectRegistry>,
}

impl ProjectController {
    pub fn new(registry: Arc<dyn ProjectRegistry>) -> Self {
        Self { registry }
    }
}

impl PipelineBuilder<ProjectSpec> for ProjectController {
    fn ensure_pipeline(
        &self,
        _resource: &Resource<ProjectSpec>,
    ) -> Pipeline<Ctx> {
        Pipeline::new()
            .step(ClaimProjectId(self.registry.clone()))
            .step(LinkBilling(self.registry.clone()))
    }

    fn cleanup_pipeline(
        &self,
        _resource: &Resource<ProjectSpec>,
    ) -> Pipeline<Ctx> {
        Pipeline::new().step(ReleaseProjectId(self.registry.clone()))
    }
}

struct ClaimProjectId(Arc<dyn ProjectRegistry>);

#[async_trait]
impl EnsureStep<Ctx> for ClaimProjectId {
    fn name(&self) -> &str {
        "claim-project-id"
    }

    async fn ensure(&self, ctx: &mut Ctx) -> Result<Outcome, Error> {
        let spec = &ctx.resource.spec;
        let current = claim_ref(&spec.project_id, &spec.tenant);
        if let Claim::Taken { tenant } =
            self.0.claim(&spec.project_id, &spec.tenant).await?
        {
            return Err(Error::critical(format!(
                "project id {} is already claimed by tenant {tenant}",
                spec.project_id
            )));
        }
        let message = format!("{} held by {}", spec.project_id, spec.tenant);

        let status = &mut ctx.resource.status;
        let stale: Vec<NodeId> = status
            .inventory
            .iter()
            .filter(|id| **id != current)
            .cloned()
            .collect();
        status.extend_inventory([&current]);
        for old in &stale {
            if self.0.release(&old.name, &old.namespace).await? {
                info!(
                    project = %old.name,
                    tenant = %old.namespace,
                    "previous project id released"
                );
            }
        }
        status.inventory = vec![current];
        status.set_component("project-id", Status::Success, message);
        Ok(Outcome::Continue)
    }
}

struct LinkBilling(Arc<dyn ProjectRegistry>);

#[async_trait]
impl EnsureStep<Ctx> for LinkBilling {
    fn name(&self) -> &str {
        "link-billing"
    }

    async fn ensure(&self, ctx: &mut Ctx) -> Result<Outcome, Error> {
        let spec = &ctx.resource.spec;
        let account = spec.billing_account.as_deref();
        if self.0.link_billing(&spec.project_id, account).await? {
            info!(project = %spec.project_id, ?account, "billing updated");
        }
        let (status, message) = match account {
            Some(account) => (Status::Success, format!("linked to {account}")),
            None => (Status::Warning, "no billing account".to_string()),
        };
        ctx.resource.status.set_component("billing", status, message);
        Ok(Outcome::Continue)
    }
}

struct ReleaseProjectId(Arc<dyn ProjectRegistry>);

#[async_trait]
impl EnsureStep<Ctx> for ReleaseProjectId {
    fn name(&self) -> &str {
        "release-project-id"
    }

    async fn ensure(&self, ctx: &mut Ctx) -> Result<Outcome, Error> {
        let spec = &ctx.resource.spec;
        let mut claims = ctx.resource.status.inventory.clone();
        let current = claim_ref(&spec.project_id, &spec.tenant);
        if !claims.contains(&current) {
            claims.push(current);
        }
        for claim in claims.iter().rev() {
            if self.0.release(&claim.name, &claim.namespace).await? {
                info!(project = %claim.name, "project id released");
            }
        }
        ctx.resource.status.inventory.clear();
        Ok(Outcome::Continue)
    }
}
