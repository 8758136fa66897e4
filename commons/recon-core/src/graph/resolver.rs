use std::collections::HashMap;

use tracing::debug;

use super::node::{DependencyNode, NodeId};
use super::GraphError;

/// Arena slot. Tarjan traversal state lives inline next to the payload.
struct Entry<T> {
    id: NodeId,
    item: T,
    depends_on: Vec<NodeId>,
    /// Arena indices of `depends_on`, filled in by `link`.
    edges: Vec<usize>,
    index: Option<usize>,
    low_link: usize,
    on_stack: bool,
}

/// Computes a safe apply order for a batch of nodes.
///
/// Built fresh for every batch: register every node with [`add_node`], then
/// call [`resolve`] once. The result lists each node after everything it
/// depends on; reverse it for deletion order.
///
/// [`add_node`]: DependencyResolver::add_node
/// [`resolve`]: DependencyResolver::resolve
pub struct DependencyResolver<T> {
    nodes: Vec<Entry<T>>,
    lookup: HashMap<String, usize>,
}

impl<T: DependencyNode> DependencyResolver<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    /// Register `node` together with the ids it depends on.
    ///
    /// # Panics
    ///
    /// Registering the same node id twice is a bug in whatever assembled the
    /// batch and aborts immediately.
    pub fn add_node<I>(&mut self, node: T, dependencies: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        let id = node.node_id();
        let key = id.key();
        if self.lookup.contains_key(&key) {
            panic!("dependency graph node {id} registered twice");
        }
        self.lookup.insert(key, self.nodes.len());
        self.nodes.push(Entry {
            id,
            item: node,
            depends_on: dependencies.into_iter().collect(),
            edges: Vec::new(),
            index: None,
            low_link: 0,
            on_stack: false,
        });
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.lookup.contains_key(&id.key())
    }

    /// Consume the graph and return its nodes in apply order.
    ///
    /// Fails with [`GraphError::DependencyNotFound`] when an edge points at an
    /// unregistered id and with [`GraphError::Cycle`] when any strongly
    /// connected component has more than one member or a node depends on
    /// itself.
    pub fn resolve(mut self) -> Result<Vec<T>, GraphError> {
        self.link()?;

        let mut next_index = 0;
        let mut stack = Vec::with_capacity(self.nodes.len());
        let mut order = Vec::with_capacity(self.nodes.len());
        for root in 0..self.nodes.len() {
            if self.nodes[root].index.is_none() {
                self.strong_connect(
                    root,
                    &mut next_index,
                    &mut stack,
                    &mut order,
                )?;
            }
        }
        debug!(nodes = order.len(), "resolved dependency order");

        let mut slots: Vec<Option<T>> =
            self.nodes.into_iter().map(|e| Some(e.item)).collect();
        Ok(order
            .into_iter()
            .filter_map(|i| slots.get_mut(i).and_then(Option::take))
            .collect())
    }

    fn link(&mut self) -> Result<(), GraphError> {
        for i in 0..self.nodes.len() {
            let mut edges = Vec::with_capacity(self.nodes[i].depends_on.len());
            for dep in &self.nodes[i].depends_on {
                match self.lookup.get(&dep.key()) {
                    Some(&j) => edges.push(j),
                    None => {
                        return Err(GraphError::DependencyNotFound {
                            node: self.nodes[i].id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
            self.nodes[i].edges = edges;
        }
        Ok(())
    }

    fn discover(
        &mut self,
        v: usize,
        next_index: &mut usize,
        stack: &mut Vec<usize>,
    ) {
        let node = &mut self.nodes[v];
        node.index = Some(*next_index);
        node.low_link = *next_index;
        node.on_stack = true;
        *next_index += 1;
        stack.push(v);
    }

    /// Iterative strong-connect rooted at `root`. `call` mirrors the
    /// recursion: each frame is a node and the position of the next edge to
    /// look at.
    fn strong_connect(
        &mut self,
        root: usize,
        next_index: &mut usize,
        stack: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), GraphError> {
        let mut call: Vec<(usize, usize)> = Vec::new();
        self.discover(root, next_index, stack);
        call.push((root, 0));

        while let Some(frame) = call.last_mut() {
            let (v, pos) = *frame;
            if let Some(&w) = self.nodes[v].edges.get(pos) {
                frame.1 += 1;
                let (w_index, w_on_stack) =
                    (self.nodes[w].index, self.nodes[w].on_stack);
                match w_index {
                    None => {
                        self.discover(w, next_index, stack);
                        call.push((w, 0));
                    }
                    // Back edge into the current component.
                    Some(w_index) if w_on_stack => {
                        let node = &mut self.nodes[v];
                        node.low_link = node.low_link.min(w_index);
                    }
                    Some(_) => {}
                }
                continue;
            }

            call.pop();
            let low = self.nodes[v].low_link;
            if let Some(&(parent, _)) = call.last() {
                let p = &mut self.nodes[parent];
                p.low_link = p.low_link.min(low);
            }
            if self.nodes[v].index == Some(low) {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    self.nodes[w].on_stack = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.emit(component, order)?;
            }
        }
        Ok(())
    }

    fn emit(
        &self,
        component: Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), GraphError> {
        match component.as_slice() {
            [single] if !self.nodes[*single].edges.contains(single) => {
                order.push(*single);
                Ok(())
            }
            _ => {
                let mut members: Vec<NodeId> = component
                    .iter()
                    .map(|&i| self.nodes[i].id.clone())
                    .collect();
                members.sort();
                Err(GraphError::Cycle { members })
            }
        }
    }
}

impl<T: DependencyNode> Default for DependencyResolver<T> {
    fn default() -> Self {
        Self::new()
    }
}
