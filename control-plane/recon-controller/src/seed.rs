//! Startup seeding of resources from a JSON file.

use std::path::Path;

use recon_core::{Resource, ResourceSpec, Store};
use serde::Deserialize;
use tracing::{debug, info};

use crate::controllers::{ApplicationSpec, ProjectSpec};

#[derive(thiserror::Error, Debug)]
pub enum SeedError {
    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid seed file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to create seeded resource: {0}")]
    Store(#[from] recon_core::Error),
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct SeedFile {
    pub applications: Vec<SeedEntry<ApplicationSpec>>,
    pub projects: Vec<SeedEntry<ProjectSpec>>,
}

#[derive(Deserialize, Debug)]
pub struct SeedEntry<S> {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub spec: S,
}

fn default_namespace() -> String {
    "default".into()
}

impl SeedFile {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SeedError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Create every entry that does not exist yet. Returns how many were
/// created.
pub async fn seed_store<S: ResourceSpec>(
    store: &dyn Store<S>,
    entries: Vec<SeedEntry<S>>,
) -> Result<usize, SeedError> {
    let mut created = 0;
    for entry in entries {
        let res = Resource::new(entry.namespace, entry.name, entry.spec);
        match store.create(res).await {
            Ok(res) => {
                debug!(key = %res.key(), "seeded");
                created += 1;
            }
            Err(recon_core::Error::AlreadyExists(key)) => {
                debug!(%key, "already present; skipped");
            }
            Err(e) => return Err(e.into()),
        }
    }
    if created > 0 {
        info!(kind = S::KIND, created, "seeded resources");
    }
    Ok(created)
}
