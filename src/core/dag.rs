//! Dependency graph over submitted tasks.
//!
//! Nodes are task ids and an edge `a -> b` means `b` depends on `a`. The
//! graph is only used for validation at submission time and for finding
//! the transitive dependents of a failed task. Readiness itself is decided
//! from each task's dependency set and the completed set.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::HashMap;

#[derive(Default)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Add a task whose dependencies were all submitted earlier.
    ///
    /// # Errors
    /// Returns [`Error::UnknownDependency`] if any dependency is not in the
    /// graph. Nothing is inserted in that case.
    pub fn add_task(&mut self, id: TaskId, dependencies: &[TaskId]) -> Result<()> {
        if let Some(missing) = dependencies.iter().find(|dep| !self.contains(dep)) {
            return Err(Error::UnknownDependency(*missing));
        }

        let node = self.node(id);
        for dep in dependencies {
            let dep_node = self.index[dep];
            self.graph.update_edge(dep_node, node, ());
        }
        Ok(())
    }

    /// Add a batch where `dependencies[i]` lists positions inside `ids`.
    ///
    /// The batch is validated as a whole before anything is inserted:
    /// positions must be in range and the batch must be acyclic.
    pub fn add_batch(&mut self, ids: &[TaskId], dependencies: &[Vec<usize>]) -> Result<()> {
        Self::validate_batch(ids, dependencies)?;

        let nodes: Vec<NodeIndex> = ids.iter().map(|id| self.node(*id)).collect();
        for (position, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                self.graph.update_edge(nodes[dep], nodes[position], ());
            }
        }
        Ok(())
    }

    /// Check positional references and acyclicity of a batch.
    pub fn validate_batch(ids: &[TaskId], dependencies: &[Vec<usize>]) -> Result<()> {
        let mut scratch: DiGraph<TaskId, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = ids.iter().map(|id| scratch.add_node(*id)).collect();

        for (position, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                if dep >= ids.len() {
                    return Err(Error::InvalidBatchReference {
                        index: position,
                        reference: dep,
                        len: ids.len(),
                    });
                }
                scratch.update_edge(nodes[dep], nodes[position], ());
            }
        }

        toposort(&scratch, None)
            .map(|_| ())
            .map_err(|cycle| Error::DependencyCycle(scratch[cycle.node_id()]))
    }

    /// Every task that directly or indirectly depends on `id`.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };

        let mut dfs = Dfs::new(&self.graph, start);
        let mut dependents = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                dependents.push(self.graph[node]);
            }
        }
        dependents
    }

    /// Direct dependencies of a task.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        match self.index.get(id) {
            Some(&node) => self
                .graph
                .neighbors_directed(node, petgraph::Direction::Incoming)
                .map(|n| self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    fn node(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&node) = self.index.get(&id) {
            return node;
        }
        let node = self.graph.add_node(id);
        self.index.insert(id, node);
        node
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
