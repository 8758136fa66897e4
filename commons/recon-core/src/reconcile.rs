use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::ensure::{Action, DEFAULT_MIN_REQUEUE_AFTER, Pipeline};
use crate::error::{Error, Result, StepError};
use crate::finalizer::FinalizerManager;
use crate::model::{ObjectKey, Resource, ResourceSpec};
use crate::patch::patch_status;
use crate::status::{ComponentStatus, ResourceStatus, Status};
use crate::store::Store;

/// State handed to every ensure step of one invocation.
pub struct ReconcileContext<S> {
    /// Working copy; steps record progress in `resource.status`.
    pub resource: Resource<S>,
    pub cancel: CancellationToken,
}

/// Per-kind source of pipelines. Called once per invocation, so the
/// returned pipeline never outlives the snapshot it was built from.
pub trait PipelineBuilder<S: ResourceSpec>: Send + Sync {
    fn ensure_pipeline(
        &self,
        resource: &Resource<S>,
    ) -> Pipeline<ReconcileContext<S>>;

    /// Cleanup run before the finalizer is released.
    fn cleanup_pipeline(
        &self,
        _resource: &Resource<S>,
    ) -> Pipeline<ReconcileContext<S>> {
        Pipeline::new()
    }
}

/// Level-triggered driver for one resource kind.
///
/// Each call to [`reconcile`](Self::reconcile) re-reads the resource and
/// walks it towards its spec: deletion candidates run the cleanup pipeline
/// and drop the finalizer, live resources get the finalizer and then the
/// ensure pipeline. Status is always written back through an optimistic
/// merge patch against the snapshot read at the start.
pub struct ReconcileLoop<S: ResourceSpec> {
    store: Arc<dyn Store<S>>,
    finalizers: FinalizerManager,
    pipelines: Arc<dyn PipelineBuilder<S>>,
    min_requeue_after: Duration,
}

impl<S: ResourceSpec> ReconcileLoop<S> {
    pub fn new(
        store: Arc<dyn Store<S>>,
        finalizers: FinalizerManager,
        pipelines: Arc<dyn PipelineBuilder<S>>,
    ) -> Self {
        Self {
            store,
            finalizers,
            pipelines,
            min_requeue_after: DEFAULT_MIN_REQUEUE_AFTER,
        }
    }

    pub fn with_min_requeue_after(mut self, floor: Duration) -> Self {
        self.min_requeue_after = floor;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store<S>> {
        &self.store
    }

    pub fn finalizers(&self) -> &FinalizerManager {
        &self.finalizers
    }

    #[instrument(
        skip_all,
        fields(kind = %key.kind, ns = %key.namespace, name = %key.name)
    )]
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<Action> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(original) = self.store.get(key).await? else {
            debug!("resource not found; nothing to do");
            return Ok(Action::done());
        };

        if self.finalizers.is_deletion_candidate(&original) {
            return self.finalize(original, cancel).await;
        }
        if original.is_deleting() {
            debug!("deletion in progress without our finalizer");
            return Ok(Action::done());
        }
        if self.finalizers.need_to_add(&original) {
            self.finalizers.add(self.store.as_ref(), &original).await?;
            return Ok(Action::requeue_now());
        }
        self.apply(original, cancel).await
    }

    async fn apply(
        &self,
        original: Resource<S>,
        cancel: &CancellationToken,
    ) -> Result<Action> {
        let pipeline = self
            .pipelines
            .ensure_pipeline(&original)
            .with_min_requeue_after(self.min_requeue_after);
        let steps = pipeline.step_names();
        if failed_permanently(&original, &steps) {
            debug!("critical failure already recorded for this generation");
            return Ok(Action::done());
        }
        let mut ctx = ReconcileContext {
            resource: original.clone(),
            cancel: cancel.clone(),
        };
        clear_step_failures(&mut ctx.resource.status, &steps);

        let outcome = pipeline.run(&mut ctx, cancel).await;
        let status = &mut ctx.resource.status;
        match &outcome {
            Ok(action) if action.is_done() => {
                status.status = status.roll_up().unwrap_or(Status::Success);
                status.observed_generation =
                    Some(original.metadata.generation);
                debug!(status = ?status.status, "reconciled");
            }
            Ok(_) => {
                status.status = status.roll_up().unwrap_or(Status::Pending);
            }
            Err(failure) => {
                record_failure(status, failure, false);
                // Pins the failure to this generation; only a spec change
                // runs the pipeline again.
                if failure.is_critical() {
                    status.observed_generation =
                        Some(original.metadata.generation);
                }
            }
        }

        self.persist_status(&original, &ctx.resource).await?;
        outcome.map_err(Error::from)
    }

    async fn finalize(
        &self,
        original: Resource<S>,
        cancel: &CancellationToken,
    ) -> Result<Action> {
        info!("running cleanup for deletion");
        let pipeline = self
            .pipelines
            .cleanup_pipeline(&original)
            .with_min_requeue_after(self.min_requeue_after);
        let mut ctx = ReconcileContext {
            resource: original.clone(),
            cancel: cancel.clone(),
        };
        clear_step_failures(
            &mut ctx.resource.status,
            &pipeline.step_names(),
        );
        ctx.resource.status.status = Status::Deleting;

        let outcome = pipeline.run(&mut ctx, cancel).await;
        match &outcome {
            Ok(action) if action.is_done() => {
                self.finalizers
                    .remove(self.store.as_ref(), &ctx.resource)
                    .await?;
                info!("cleanup complete; finalizer released");
                return Ok(Action::done());
            }
            Ok(_) => ctx.resource.status.status = Status::Deleting,
            Err(failure) => {
                record_failure(&mut ctx.resource.status, failure, true)
            }
        }

        self.persist_status(&original, &ctx.resource).await?;
        outcome.map_err(Error::from)
    }

    /// A failed patch wins over the pipeline result: if the status write
    /// didn't land the invocation must be retried from a fresh read.
    async fn persist_status(
        &self,
        original: &Resource<S>,
        modified: &Resource<S>,
    ) -> Result<()> {
        if let Err(e) =
            patch_status(self.store.as_ref(), original, modified).await
        {
            warn!(error = %e, "status patch failed");
            return Err(e);
        }
        Ok(())
    }
}

/// A critical step failure recorded against the current generation.
fn failed_permanently<S>(res: &Resource<S>, steps: &[&str]) -> bool {
    res.status.observed_generation == Some(res.metadata.generation)
        && res.status.components.iter().any(|c| {
            c.status == Status::Failure && steps.contains(&c.name.as_str())
        })
}

/// Drop failure entries a previous invocation wrote for these steps; they
/// are written again below if the failure persists.
fn clear_step_failures(status: &mut ResourceStatus, steps: &[&str]) {
    status.components.retain(|c| {
        !(steps.contains(&c.name.as_str())
            && matches!(
                c.status,
                Status::Error | Status::Failure | Status::DeleteFailed
            ))
    });
}

fn record_failure(
    status: &mut ResourceStatus,
    failure: &StepError,
    deleting: bool,
) {
    let critical = failure.is_critical();
    let (overall, message) = match (deleting, critical) {
        (true, _) => (Status::DeleteFailed, "cleanup failed"),
        (false, true) => (Status::Failure, "failed permanently"),
        (false, false) => (Status::Error, "failed; will retry"),
    };
    warn!(
        step = %failure.step,
        critical,
        error = %failure.source,
        "ensure step failed"
    );
    status.upsert_component(
        ComponentStatus::new(&failure.step, overall, message)
            .with_detail(failure.source.to_string()),
    );
    status.status = overall;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::Widget;
    use crate::status::ComponentStatus;

    #[test]
    fn only_failures_of_known_steps_are_cleared() {
        let mut status = ResourceStatus::default();
        status.set_component("apply", Status::Error, "failed");
        status.set_component("apply-ok", Status::Success, "ok");
        status.set_component("external", Status::Failure, "other writer");
        clear_step_failures(&mut status, &["apply", "apply-ok"]);
        let names: Vec<&str> =
            status.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["apply-ok", "external"]);
    }

    #[test]
    fn critical_failure_is_terminal_for_its_generation() {
        let mut res = Resource::new("ns", "a", Widget { size: 1 });
        res.metadata.generation = 2;
        res.status.set_component("claim", Status::Failure, "failed");
        assert!(!failed_permanently(&res, &["claim"]));

        res.status.observed_generation = Some(2);
        assert!(failed_permanently(&res, &["claim"]));
        assert!(!failed_permanently(&res, &["other-step"]));

        res.metadata.generation = 3;
        assert!(!failed_permanently(&res, &["claim"]));

        res.status.observed_generation = Some(3);
        res.status.set_component("claim", Status::Error, "will retry");
        assert!(!failed_permanently(&res, &["claim"]));
    }

    #[test]
    fn failure_records_step_component() {
        let mut status = ResourceStatus::default();
        let failure =
            StepError::new("claim", Error::critical("id owned by tenant b"));
        record_failure(&mut status, &failure, false);
        assert_eq!(status.status, Status::Failure);
        let component: &ComponentStatus = status.component("claim").unwrap();
        assert_eq!(component.status, Status::Failure);
        assert_eq!(component.detail, "id owned by tenant b");

        let failure = StepError::new("cleanup", Error::retryable("flake"));
        record_failure(&mut status, &failure, true);
        assert_eq!(status.status, Status::DeleteFailed);
    }
}
