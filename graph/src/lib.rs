//! Dependency graph for service orchestration.
//!
//! Acyclic by construction: `add_node` rejects edges that would close a
//! cycle, so traversal never needs cycle guards. Graphs stay small (tens of
//! nodes), so queries are simple O(V+E) walks. The graph itself is not
//! thread-safe; the orchestrator wraps it in a lock.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Service,
    Aggregator,
    Connection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node `{id}` already exists")]
    DuplicateNode { id: String },

    #[error("node `{id}` depends on missing node `{dependency}`")]
    MissingDependency { id: String, dependency: String },

    #[error("adding node `{id}` would create a dependency cycle")]
    Cycle { id: String },

    #[error("unknown node `{id}`")]
    UnknownNode { id: String },

    #[error("node `{id}` still has dependents: {dependents:?}")]
    HasDependents {
        id: String,
        dependents: Vec<String>,
    },
}

/// Directed acyclic graph of lifecycle-managed nodes.
///
/// Edges point from a node to the nodes it depends on. BTree containers keep
/// iteration deterministic, which keeps start order stable run to run.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, Node>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Every referenced dependency must already exist, which
    /// also means a new node can never close a cycle unless it reaches
    /// itself through existing edges.
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        kind: NodeKind,
        depends_on: Vec<String>,
    ) -> Result<(), GraphError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateNode { id });
        }
        for dependency in &depends_on {
            if *dependency == id {
                return Err(GraphError::Cycle { id });
            }
            if !self.nodes.contains_key(dependency) {
                return Err(GraphError::MissingDependency {
                    id,
                    dependency: dependency.clone(),
                });
            }
        }
        // Self-reachability through existing edges closes a cycle.
        for dependency in &depends_on {
            if self.reaches(dependency, &id) {
                return Err(GraphError::Cycle { id });
            }
        }
        self.nodes.insert(
            id.clone(),
            Node {
                id,
                kind,
                depends_on,
            },
        );
        Ok(())
    }

    /// Remove a node that nothing depends on.
    pub fn remove_node(&mut self, id: &str) -> Result<Node, GraphError> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::UnknownNode { id: id.to_string() });
        }
        let dependents = self.dependents(id)?;
        if !dependents.is_empty() {
            return Err(GraphError::HasDependents {
                id: id.to_string(),
                dependents,
            });
        }
        Ok(self.nodes.remove(id).unwrap_or_else(|| unreachable!()))
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies(&self, id: &str) -> Result<Vec<String>, GraphError> {
        self.nodes
            .get(id)
            .map(|node| node.depends_on.clone())
            .ok_or_else(|| GraphError::UnknownNode { id: id.to_string() })
    }

    /// Nodes that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> Result<Vec<String>, GraphError> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::UnknownNode { id: id.to_string() });
        }
        Ok(self
            .nodes
            .values()
            .filter(|node| node.depends_on.iter().any(|dep| dep == id))
            .map(|node| node.id.clone())
            .collect())
    }

    /// Every node that transitively depends on `id`, excluding `id` itself.
    /// This is the cascade-stop closure.
    pub fn transitive_dependents(&self, id: &str) -> Result<Vec<String>, GraphError> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::UnknownNode { id: id.to_string() });
        }
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for node in self.nodes.values() {
                if node.depends_on.iter().any(|dep| *dep == current)
                    && seen.insert(node.id.clone())
                {
                    queue.push_back(node.id.clone());
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Dependencies-first total order (Kahn).
    pub fn topological_order(&self) -> Vec<String> {
        self.topological_levels().into_iter().flatten().collect()
    }

    /// Topological order grouped by depth; nodes within one level share no
    /// dependency path and may start in parallel.
    pub fn topological_levels(&self) -> Vec<Vec<String>> {
        let mut remaining_deps: BTreeMap<&str, BTreeSet<&str>> = self
            .nodes
            .values()
            .map(|node| {
                (
                    node.id.as_str(),
                    node.depends_on.iter().map(String::as_str).collect(),
                )
            })
            .collect();

        let mut levels = Vec::new();
        while !remaining_deps.is_empty() {
            let ready: Vec<String> = remaining_deps
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| (*id).to_string())
                .collect();
            // Acyclic by construction, so progress is guaranteed.
            debug_assert!(!ready.is_empty());
            if ready.is_empty() {
                break;
            }
            for id in &ready {
                remaining_deps.remove(id.as_str());
            }
            for deps in remaining_deps.values_mut() {
                for id in &ready {
                    deps.remove(id.as_str());
                }
            }
            levels.push(ready);
        }
        levels
    }

    /// True when `to` is reachable from `from` along dependency edges.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if let Some(node) = self.nodes.get(&current) {
                for dep in &node.depends_on {
                    if seen.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }
        false
    }
}
