use std::sync::Arc;

use envconfig::Envconfig;
use recon_controller::{
    ControllerRegistry,
    config::ControllerConfig,
    controllers::{
        ApplicationSpec, InMemoryProjectRegistry, ProjectSpec,
        application_runtime, project_runtime,
    },
    init_tracing,
    seed::{SeedFile, seed_store},
};
use recon_core::{InMemoryStore, apply::InMemoryCluster};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cfg = ControllerConfig::init_from_env()?.apply_profile_defaults();
    info!(?cfg, "Starting reconcile controllers");

    let applications = Arc::new(InMemoryStore::<ApplicationSpec>::new());
    let projects = Arc::new(InMemoryStore::<ProjectSpec>::new());
    let cluster = Arc::new(InMemoryCluster::new());
    let project_registry = Arc::new(InMemoryProjectRegistry::new());

    if let Some(path) = &cfg.seed_file {
        let seed = SeedFile::load(path).await?;
        seed_store(applications.as_ref(), seed.applications).await?;
        seed_store(projects.as_ref(), seed.projects).await?;
    }

    let mut registry = ControllerRegistry::new();
    registry.register(application_runtime(&cfg, applications, cluster))?;
    registry.register(project_runtime(&cfg, projects, project_registry))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    registry.run(shutdown).await?;
    Ok(())
}
