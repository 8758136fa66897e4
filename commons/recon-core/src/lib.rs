//! Building blocks for level-triggered reconcilers: finalizer handling,
//! dependency-ordered apply, ensure pipelines and status patching.

pub mod apply;
pub mod ensure;
pub mod error;
pub mod finalizer;
pub mod graph;
pub mod model;
pub mod patch;
pub mod reconcile;
pub mod status;
pub mod store;

pub use ensure::{Action, EnsureStep, FnStep, Outcome, Pipeline};
pub use error::{Error, ErrorKind, Result, StepError};
pub use finalizer::FinalizerManager;
pub use model::{ObjectKey, ObjectMeta, Resource, ResourceSpec};
pub use reconcile::{PipelineBuilder, ReconcileContext, ReconcileLoop};
pub use status::{ComponentStatus, ResourceStatus, Status};
pub use store::{InMemoryStore, Store, WatchEvent};
