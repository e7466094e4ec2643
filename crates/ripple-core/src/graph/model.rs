//! Repo node model: identity, manifest dependencies, and the derived
//! `dependents` inverse relation.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Manifest section a dependency entry was declared in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[default]
    Normal,
    Dev,
    Peer,
}

/// One dependency entry from a repo's package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRef {
    /// Target package name, e.g. `"@acme/lib-a"`.
    pub name: String,
    /// Version constraint as written in the manifest, e.g. `"^1.0.0"`.
    pub version_spec: String,
    /// Id of the repo that publishes `name`, or `None` for external packages.
    #[serde(default)]
    pub resolved_id: Option<String>,
    #[serde(default)]
    pub kind: DependencyKind,
}

impl DependencyRef {
    /// Create an internal dependency on `resolved_id`.
    pub fn internal(
        name: impl Into<String>,
        version_spec: impl Into<String>,
        resolved_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version_spec: version_spec.into(),
            resolved_id: Some(resolved_id.into()),
            kind: DependencyKind::Normal,
        }
    }

    /// Create a dependency on a package outside the repo set.
    pub fn external(name: impl Into<String>, version_spec: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_spec: version_spec.into(),
            resolved_id: None,
            kind: DependencyKind::Normal,
        }
    }

    /// Set the manifest section.
    pub fn with_kind(mut self, kind: DependencyKind) -> Self {
        self.kind = kind;
        self
    }

    /// Resolved target id, treating an empty string as unresolved.
    pub fn target(&self) -> Option<&str> {
        self.resolved_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// A single repository in the dependency graph, as produced by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoNode {
    /// Stable identifier, unique within a node set.
    pub id: String,
    /// Published package name.
    #[serde(rename = "npmPackage")]
    pub package_name: String,
    /// Version in the local manifest.
    pub version: String,
    /// Working directory of the repo checkout.
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    /// Ids of repos declaring this repo as a dependency. Derived; see
    /// [`derive_dependents`].
    #[serde(default)]
    pub dependents: Vec<String>,
}

impl RepoNode {
    /// Create a node with no dependencies.
    pub fn new(
        id: impl Into<String>,
        package_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            package_name: package_name.into(),
            version: version.into(),
            path: PathBuf::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
        }
    }

    /// Set the working directory.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Append a dependency entry.
    pub fn with_dependency(mut self, dep: DependencyRef) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// Distinct internal targets of this node, in declaration order, limited
    /// to ids present in `known`.
    pub(crate) fn internal_targets<'a>(&'a self, known: &HashSet<&str>) -> Vec<&'a str> {
        let mut seen = HashSet::new();
        self.dependencies
            .iter()
            .filter_map(DependencyRef::target)
            .filter(|t| known.contains(t) && seen.insert(*t))
            .collect()
    }
}

/// Recompute every node's `dependents` from the `dependencies` of all nodes.
///
/// Any previously stored `dependents` are discarded. Order follows the input
/// node order; each dependent appears once per target.
pub fn derive_dependents(mut nodes: Vec<RepoNode>) -> Vec<RepoNode> {
    let inverse = {
        let known: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let mut inverse: HashMap<String, Vec<String>> = HashMap::new();
        for node in &nodes {
            for target in node.internal_targets(&known) {
                inverse
                    .entry(target.to_string())
                    .or_default()
                    .push(node.id.clone());
            }
        }
        inverse
    };

    for node in &mut nodes {
        node.dependents = inverse.get(&node.id).cloned().unwrap_or_default();
    }
    nodes
}
