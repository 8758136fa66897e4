use futures_util::future::{BoxFuture, join_all};
use recon_core::ResourceSpec;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::runtime::ControllerRuntime;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a controller for kind {0} is already registered")]
    DuplicateKind(String),
    #[error("no controllers registered")]
    Empty,
}

trait RunController: Send {
    fn kind(&self) -> &'static str;

    fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}

impl<S: ResourceSpec> RunController for ControllerRuntime<S> {
    fn kind(&self) -> &'static str {
        ControllerRuntime::kind(self)
    }

    fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(ControllerRuntime::run(*self, shutdown))
    }
}

/// The set of controllers a process runs, one per resource kind.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Vec<Box<dyn RunController>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: ResourceSpec>(
        &mut self,
        runtime: ControllerRuntime<S>,
    ) -> Result<(), RegistryError> {
        if self.contains(S::KIND) {
            return Err(RegistryError::DuplicateKind(S::KIND.to_string()));
        }
        self.controllers.push(Box::new(runtime));
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.controllers.iter().any(|c| c.kind() == kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.controllers.iter().map(|c| c.kind()).collect()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Run every registered controller until `shutdown` is cancelled.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), RegistryError> {
        if self.controllers.is_empty() {
            return Err(RegistryError::Empty);
        }
        info!(kinds = ?self.kinds(), "starting controllers");
        let runs = self
            .controllers
            .into_iter()
            .map(|c| c.run(shutdown.clone()));
        join_all(runs).await;
        Ok(())
    }
}
