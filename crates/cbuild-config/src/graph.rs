//! Build dependency graph construction.
//!
//! Edges are added one at a time in manifest order while keeping the full
//! transitive closure of every node in both directions. An edge
//! `build -> dep` closes a cycle exactly when `dep` already (transitively)
//! depends on `build`, so cycle detection is a set lookup per edge and no
//! separate topological sort is needed.

use cbuild_core::build::BuildSpec;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::GraphError;

/// A build with its transitive relations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildNode {
    pub key: String,
    /// Every build this one transitively depends on.
    pub depends_on: BTreeSet<String>,
    /// Every build that transitively depends on this one.
    pub dependency_for: BTreeSet<String>,
}

/// Validated, acyclic dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<String>,
    nodes: BTreeMap<String, BuildNode>,
}

impl DependencyGraph {
    /// Build the graph from specs in manifest order.
    pub fn build(specs: &[BuildSpec]) -> Result<Self, GraphError> {
        let edges: Vec<(&str, &[String])> = specs
            .iter()
            .map(|s| (s.key.as_str(), s.depends_on.as_slice()))
            .collect();
        Self::from_edges(&edges)
    }

    /// Build the graph from `(build, direct dependencies)` pairs.
    pub fn from_edges(edges: &[(&str, &[String])]) -> Result<Self, GraphError> {
        let mut graph = DependencyGraph {
            order: edges.iter().map(|(key, _)| key.to_string()).collect(),
            nodes: edges
                .iter()
                .map(|(key, _)| {
                    let node = BuildNode {
                        key: key.to_string(),
                        ..Default::default()
                    };
                    (key.to_string(), node)
                })
                .collect(),
        };

        for (build, deps) in edges {
            for dep in deps.iter() {
                graph.add_edge(build, dep)?;
            }
        }

        Ok(graph)
    }

    fn add_edge(&mut self, build: &str, dep: &str) -> Result<(), GraphError> {
        if build == dep {
            return Err(GraphError::SelfDependency {
                build: build.to_string(),
            });
        }

        let dep_node = self
            .nodes
            .get(dep)
            .ok_or_else(|| GraphError::MissingDependency {
                build: build.to_string(),
                dependency: dep.to_string(),
            })?;

        if dep_node.depends_on.contains(build) {
            return Err(GraphError::CircularDependency {
                build: build.to_string(),
                dependency: dep.to_string(),
            });
        }

        let mut ancestors = dep_node.depends_on.clone();
        ancestors.insert(dep.to_string());

        let mut dependents = self
            .nodes
            .get(build)
            .map(|n| n.dependency_for.clone())
            .unwrap_or_default();
        dependents.insert(build.to_string());

        for key in &dependents {
            if let Some(node) = self.nodes.get_mut(key) {
                node.depends_on.extend(ancestors.iter().cloned());
            }
        }
        for key in &ancestors {
            if let Some(node) = self.nodes.get_mut(key) {
                node.dependency_for.extend(dependents.iter().cloned());
            }
        }

        Ok(())
    }

    pub fn node(&self, key: &str) -> Option<&BuildNode> {
        self.nodes.get(key)
    }

    /// Nodes in manifest order.
    pub fn nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.order.iter().filter_map(|key| self.nodes.get(key))
    }

    /// Group builds by depth: builds in a group only depend on earlier groups.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();

        // Transitive dependency counts order a DAG topologically.
        let mut sorted: Vec<&BuildNode> = self.nodes().collect();
        sorted.sort_by_key(|n| n.depends_on.len());

        for node in sorted {
            let level = node
                .depends_on
                .iter()
                .filter_map(|d| depth.get(d.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node.key.as_str(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node.key.clone());
        }

        levels
    }
}
