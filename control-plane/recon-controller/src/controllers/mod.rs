pub mod application;
pub mod project;

use std::sync::Arc;

use recon_core::apply::Applier;
use recon_core::{
    FinalizerManager, PipelineBuilder, ReconcileLoop, ResourceSpec, Store,
};

pub use application::{ApplicationController, ApplicationSpec};
pub use project::{
    InMemoryProjectRegistry, ProjectController, ProjectRegistry, ProjectSpec,
};

use crate::config::ControllerConfig;
use crate::runtime::{ControllerRuntime, RuntimeSettings};

fn reconcile_loop<S: ResourceSpec>(
    cfg: &ControllerConfig,
    store: Arc<dyn Store<S>>,
    pipelines: Arc<dyn PipelineBuilder<S>>,
) -> ReconcileLoop<S> {
    ReconcileLoop::new(
        store,
        FinalizerManager::new(cfg.finalizer_token(S::KIND)),
        pipelines,
    )
    .with_min_requeue_after(cfg.reconcile.min_requeue_after())
}

pub fn application_runtime(
    cfg: &ControllerConfig,
    store: Arc<dyn Store<ApplicationSpec>>,
    applier: Arc<dyn Applier>,
) -> ControllerRuntime<ApplicationSpec> {
    let pipelines: Arc<dyn PipelineBuilder<ApplicationSpec>> =
        Arc::new(ApplicationController::new(applier));
    ControllerRuntime::new(
        reconcile_loop(cfg, store, pipelines),
        RuntimeSettings::from_config(cfg),
    )
}

pub fn project_runtime(
    cfg: &ControllerConfig,
    store: Arc<dyn Store<ProjectSpec>>,
    registry: Arc<dyn ProjectRegistry>,
) -> ControllerRuntime<ProjectSpec> {
    let pipelines: Arc<dyn PipelineBuilder<ProjectSpec>> =
        Arc::new(ProjectController::new(registry));
    ControllerRuntime::new(
        reconcile_loop(cfg, store, pipelines),
        RuntimeSettings::from_config(cfg),
    )
}
