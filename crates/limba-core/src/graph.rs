//! Dependency graph arena used by the installer.
//!
//! All nodes live in one owner vector; edges are indices into it. A node
//! either carries an install candidate (an opened [`PackageArchive`]) or
//! stands for an already-installed dependency. Foundation dependencies are
//! not nodes; they are recorded separately.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::PackageArchive;
use crate::config::ConfigError;
use crate::foundations::Foundations;
use crate::paths;
use crate::pkginfo::PkgInfo;

/// Errors raised by graph operations.
#[derive(Error, Debug)]
pub enum GraphError {
    /// A foundation dependency cannot be satisfied by this host.
    #[error("host does not provide required component: {0}")]
    FoundationNotFound(String),

    /// The foundations catalog could not be read.
    #[error("unable to load foundations catalog: {0}")]
    Config(#[from] ConfigError),
}

/// Lifecycle stage of a package inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageStage {
    /// Waiting for earlier members of the plan.
    Pending,
    /// The package file is being downloaded.
    Downloading,
    /// Embedded data is being extracted.
    Extracting,
    /// The payload is being installed.
    Installing,
    /// Installation finished.
    Installed,
}

impl std::fmt::Display for PackageStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Installing => "installing",
            Self::Installed => "installed",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
struct GraphNode {
    info: PkgInfo,
    candidate: Option<Arc<PackageArchive>>,
    parent: Option<usize>,
    children: Vec<usize>,
    origin: bool,
    stage: PackageStage,
}

/// The resolver's working graph.
#[derive(Debug, Default)]
pub struct PackageGraph {
    nodes: Vec<GraphNode>,
    foundations: Option<Foundations>,
    foundation_deps: Vec<PkgInfo>,
    ignore_foundations: bool,
}

impl PackageGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load auxiliary data (the foundations catalog). Idempotent.
    pub fn initialize(&mut self) -> Result<(), GraphError> {
        if self.foundations.is_none() {
            self.foundations = Some(Foundations::load(&paths::foundations_list())?);
        }
        Ok(())
    }

    /// Replace the foundations catalog (tests, build tooling).
    pub fn set_foundations(&mut self, foundations: Foundations) {
        self.foundations = Some(foundations);
    }

    /// Treat unsatisfiable foundation dependencies as warnings.
    pub fn set_ignore_foundations(&mut self, ignore: bool) {
        self.ignore_foundations = ignore;
    }

    /// Drop all nodes and recorded foundation dependencies.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.foundation_deps.clear();
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node for an already-satisfied (installed) dependency.
    pub fn add_package(&mut self, parent: Option<usize>, info: PkgInfo) -> usize {
        self.push_node(parent, info, None)
    }

    /// Add a node carrying an install candidate.
    pub fn add_install_todo(
        &mut self,
        parent: Option<usize>,
        archive: Arc<PackageArchive>,
    ) -> usize {
        let info = archive.info().clone();
        self.push_node(parent, info, Some(archive))
    }

    fn push_node(
        &mut self,
        parent: Option<usize>,
        info: PkgInfo,
        candidate: Option<Arc<PackageArchive>>,
    ) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(GraphNode {
            info,
            candidate,
            parent,
            children: Vec::new(),
            origin: parent.is_none(),
            stage: PackageStage::Pending,
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(idx);
        }
        idx
    }

    /// Metadata of a node.
    #[must_use]
    pub fn info(&self, idx: usize) -> &PkgInfo {
        &self.nodes[idx].info
    }

    /// Mutable metadata of a node.
    pub fn info_mut(&mut self, idx: usize) -> &mut PkgInfo {
        &mut self.nodes[idx].info
    }

    /// The node's install candidate, if it carries one.
    #[must_use]
    pub fn install_candidate(&self, idx: usize) -> Option<&Arc<PackageArchive>> {
        self.nodes[idx].candidate.as_ref()
    }

    /// Whether the node was the resolver's seed.
    #[must_use]
    pub fn is_origin(&self, idx: usize) -> bool {
        self.nodes[idx].origin
    }

    /// Parent edge of a node.
    #[must_use]
    pub fn parent(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].parent
    }

    /// Current stage of a node.
    #[must_use]
    pub fn stage(&self, idx: usize) -> PackageStage {
        self.nodes[idx].stage
    }

    /// Move a node to a new stage.
    pub fn set_stage(&mut self, idx: usize, stage: PackageStage) {
        self.nodes[idx].stage = stage;
    }

    /// Find a node by package id.
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.info.id() == id)
    }

    /// Find a node whose package satisfies the requirement.
    #[must_use]
    pub fn find_satisfying(&self, req: &PkgInfo) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.info.satisfies_requirement(req))
    }

    /// Test a dependency against the foundations catalog.
    ///
    /// Returns `Ok(false)` when the dependency is not a foundation at all.
    /// A satisfied (or ignored) foundation dependency is recorded and
    /// yields `Ok(true)`; an unsatisfiable one is an error.
    pub fn test_foundation_dependency(&mut self, dep: &PkgInfo) -> Result<bool, GraphError> {
        if !Foundations::is_foundation_dep(dep) {
            return Ok(false);
        }

        let satisfied = self
            .foundations
            .as_ref()
            .and_then(|f| f.find_satisfying(dep))
            .cloned();
        match satisfied {
            Some(component) => {
                self.foundation_deps.push(component);
                Ok(true)
            }
            None if self.ignore_foundations => {
                tracing::warn!(
                    "assuming host provides {} (foundation checks disabled)",
                    dep.name_relation_string()
                );
                self.foundation_deps.push(dep.clone());
                Ok(true)
            }
            None => Err(GraphError::FoundationNotFound(dep.name_relation_string())),
        }
    }

    /// Foundation dependencies recorded during resolution.
    #[must_use]
    pub fn foundation_dependencies(&self) -> &[PkgInfo] {
        &self.foundation_deps
    }

    /// Post-order traversal of the subtree below `root` (children before
    /// parents), with duplicate package ids reduced to their first visit.
    #[must_use]
    pub fn post_order(&self, root: usize) -> Vec<usize> {
        let mut order = Vec::new();
        let mut seen = std::collections::HashSet::new();
        self.post_order_into(root, &mut order, &mut seen);
        order
    }

    fn post_order_into(
        &self,
        idx: usize,
        order: &mut Vec<usize>,
        seen: &mut std::collections::HashSet<String>,
    ) {
        for &child in &self.nodes[idx].children {
            self.post_order_into(child, order, seen);
        }
        if seen.insert(self.nodes[idx].info.id()) {
            order.push(idx);
        }
    }

    /// Ids of every node except `root`, deduplicated in discovery order.
    #[must_use]
    pub fn member_ids_except(&self, root: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if idx == root {
                continue;
            }
            let id = node.info.id();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkginfo::VersionRelation;

    fn info(name: &str, version: &str) -> PkgInfo {
        let mut info = PkgInfo::new();
        info.name = name.to_string();
        info.version = version.to_string();
        info
    }

    #[test]
    fn test_post_order_children_first() {
        let mut graph = PackageGraph::new();
        let root = graph.add_package(None, info("app", "1.0"));
        let dep_a = graph.add_package(Some(root), info("liba", "1.0"));
        let dep_b = graph.add_package(Some(root), info("libb", "1.0"));
        let nested = graph.add_package(Some(dep_a), info("libc", "1.0"));

        let order = graph.post_order(root);
        assert_eq!(order, vec![nested, dep_a, dep_b, root]);
    }

    #[test]
    fn test_post_order_dedups_ids() {
        let mut graph = PackageGraph::new();
        let root = graph.add_package(None, info("app", "1.0"));
        let dep_a = graph.add_package(Some(root), info("liba", "1.0"));
        // Same package satisfied again for a second parent.
        let dep_b = graph.add_package(Some(root), info("libb", "1.0"));
        graph.add_package(Some(dep_b), info("liba", "1.0"));

        let order = graph.post_order(root);
        let ids: Vec<String> = order.iter().map(|&i| graph.info(i).id()).collect();
        assert_eq!(ids, ["liba/1.0", "libb/1.0", "app/1.0"]);
        assert!(order.contains(&dep_a));
    }

    #[test]
    fn test_member_ids_except_root() {
        let mut graph = PackageGraph::new();
        let root = graph.add_package(None, info("app", "1.0"));
        graph.add_package(Some(root), info("liba", "1.0"));
        graph.add_package(Some(root), info("libb", "1.0"));

        let ids = graph.member_ids_except(root);
        assert_eq!(ids, ["liba/1.0", "libb/1.0"]);
    }

    #[test]
    fn test_foundation_dependency() {
        let mut graph = PackageGraph::new();
        graph.set_foundations(Foundations::from_components(vec![info(
            "foundation:glibc",
            "2.38",
        )]));

        let plain = PkgInfo::requirement("libgreet", VersionRelation::empty(), "");
        assert!(!graph.test_foundation_dependency(&plain).unwrap());

        let glibc = PkgInfo::requirement("foundation:glibc", VersionRelation::empty(), "");
        assert!(graph.test_foundation_dependency(&glibc).unwrap());
        assert_eq!(graph.foundation_dependencies().len(), 1);

        let missing = PkgInfo::requirement("foundation:qt", VersionRelation::empty(), "");
        assert!(matches!(
            graph.test_foundation_dependency(&missing),
            Err(GraphError::FoundationNotFound(_))
        ));

        graph.set_ignore_foundations(true);
        assert!(graph.test_foundation_dependency(&missing).unwrap());
    }

    #[test]
    fn test_reset() {
        let mut graph = PackageGraph::new();
        graph.add_package(None, info("app", "1.0"));
        assert!(!graph.is_empty());
        graph.reset();
        assert!(graph.is_empty());
    }
}
