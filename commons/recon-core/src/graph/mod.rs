//! Dependency ordering for batches of generated child resources.
//!
//! Nodes are identified by `(group, version, kind, namespace, name)`; edges
//! mean "depends on". Ordering uses Tarjan's strongly connected components
//! over an arena of nodes, which yields dependencies before dependents and
//! flags every component with more than one member as a cycle.

mod node;
mod resolver;

pub use node::{DependencyNode, NodeId, split_api_version};
pub use resolver::DependencyResolver;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("circular reference between {}", join(.members))]
    Cycle { members: Vec<NodeId> },
    #[error("dependency {dependency} of {node} not found")]
    DependencyNotFound { node: NodeId, dependency: NodeId },
}

fn join(ids: &[NodeId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
