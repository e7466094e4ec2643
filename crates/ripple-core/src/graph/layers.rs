//! Edge construction, Kahn layering and flat topological ordering.
//!
//! An edge `from → to` means "`from` depends on `to`". Layer 0 holds repos
//! with no internal dependencies; every other repo sits exactly one layer
//! above its deepest dependency. Repos that never reach in-degree zero are
//! part of (or downstream of) a cycle and are reported as unlayered.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CascadeError, CascadeResult};
use crate::graph::model::{derive_dependents, RepoNode};

/// A resolved internal dependency edge: `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub version_spec: String,
}

/// Result of Kahn peeling over a node set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layering {
    /// Layer index → repo ids, in discovery order.
    pub layers: BTreeMap<usize, Vec<String>>,
    /// Repos that never reached in-degree zero (cycle members and everything
    /// depending on them), in input order.
    pub unlayered: Vec<String>,
}

impl Layering {
    /// Layer index of `id`, if it was layered.
    pub fn layer_of(&self, id: &str) -> Option<usize> {
        self.layers
            .iter()
            .find(|(_, ids)| ids.iter().any(|x| x == id))
            .map(|(layer, _)| *layer)
    }

    /// Number of layered repos.
    pub fn layered_count(&self) -> usize {
        self.layers.values().map(Vec::len).sum()
    }
}

/// Adjacency derived once from a node set.
struct Adjacency<'a> {
    in_degree: HashMap<&'a str, usize>,
    dependents: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> Adjacency<'a> {
    fn new(nodes: &'a [RepoNode]) -> Self {
        let known: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::with_capacity(nodes.len());

        for node in nodes {
            let targets = node.internal_targets(&known);
            in_degree.insert(node.id.as_str(), targets.len());
            for target in targets {
                dependents.entry(target).or_default().push(node.id.as_str());
            }
        }
        Self {
            in_degree,
            dependents,
        }
    }

    fn zero_degree_in_input_order(&self, nodes: &'a [RepoNode]) -> Vec<&'a str> {
        nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| self.in_degree.get(id) == Some(&0))
            .collect()
    }

    /// Decrement the in-degree of every dependent of `id`, returning those
    /// that just reached zero.
    fn release(&mut self, id: &str) -> Vec<&'a str> {
        let mut ready = Vec::new();
        if let Some(deps) = self.dependents.get(id) {
            for &dep in deps {
                if let Some(deg) = self.in_degree.get_mut(dep) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        ready.push(dep);
                    }
                }
            }
        }
        ready
    }
}

/// Group repos into topological layers with Kahn peeling.
///
/// O(V + E). Duplicate manifest entries for the same target count once.
pub fn calculate_layers(nodes: &[RepoNode]) -> Layering {
    let mut adj = Adjacency::new(nodes);
    let mut layers = BTreeMap::new();
    let mut placed: HashSet<&str> = HashSet::with_capacity(nodes.len());

    let mut current = adj.zero_degree_in_input_order(nodes);
    let mut index = 0usize;
    while !current.is_empty() {
        let mut next = Vec::new();
        for &id in &current {
            placed.insert(id);
            next.extend(adj.release(id));
        }
        layers.insert(index, current.iter().map(|s| s.to_string()).collect());
        current = next;
        index += 1;
    }

    let unlayered: Vec<String> = nodes
        .iter()
        .filter(|n| !placed.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect();
    if !unlayered.is_empty() {
        warn!(repos = ?unlayered, "dependency cycle: repos left out of every layer");
    }

    Layering { layers, unlayered }
}

/// Return repo ids in dependency order (dependencies before dependents).
///
/// Uses Kahn's algorithm with a FIFO queue seeded in input order. Returns
/// [`CascadeError::DependencyCycle`] naming the repos that could not be
/// ordered.
pub fn topological_sort(nodes: &[RepoNode]) -> CascadeResult<Vec<String>> {
    let mut adj = Adjacency::new(nodes);
    let mut queue: VecDeque<&str> = adj.zero_degree_in_input_order(nodes).into();
    let mut sorted = Vec::with_capacity(nodes.len());

    while let Some(id) = queue.pop_front() {
        sorted.push(id.to_string());
        queue.extend(adj.release(id));
    }

    if sorted.len() != nodes.len() {
        let ordered: HashSet<&str> = sorted.iter().map(String::as_str).collect();
        return Err(CascadeError::DependencyCycle {
            repos: nodes
                .iter()
                .filter(|n| !ordered.contains(n.id.as_str()))
                .map(|n| n.id.clone())
                .collect(),
        });
    }
    Ok(sorted)
}

/// Directed dependency graph over [`RepoNode`]s.
///
/// Built once per node set; `dependents` on every node are recomputed from
/// `dependencies` at construction time.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<RepoNode>,
    edges: Vec<Edge>,
    layering: Layering,
    index: HashMap<String, usize>,
    /// `dependent_id → [dependency_id, ...]` (upstream adjacency, internal only)
    upstream: HashMap<String, Vec<String>>,
}

/// Build the graph: derived dependents, edge list and layering.
///
/// Every dependency entry whose target is a repo in `nodes` becomes an edge,
/// duplicates included.
pub fn build_graph(nodes: &[RepoNode]) -> DependencyGraph {
    let nodes = derive_dependents(nodes.to_vec());
    let known: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

    let edges: Vec<Edge> = nodes
        .iter()
        .flat_map(|node| {
            node.dependencies.iter().filter_map(|dep| {
                dep.target()
                    .filter(|t| known.contains(t))
                    .map(|t| Edge {
                        from: node.id.clone(),
                        to: t.to_string(),
                        version_spec: dep.version_spec.clone(),
                    })
            })
        })
        .collect();

    let upstream = nodes
        .iter()
        .map(|n| {
            let targets = n
                .internal_targets(&known)
                .into_iter()
                .map(str::to_string)
                .collect();
            (n.id.clone(), targets)
        })
        .collect();

    let layering = calculate_layers(&nodes);
    let index = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i))
        .collect();

    DependencyGraph {
        nodes,
        edges,
        layering,
        index,
        upstream,
    }
}

impl DependencyGraph {
    /// All nodes, with derived `dependents`.
    pub fn nodes(&self) -> &[RepoNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn layering(&self) -> &Layering {
        &self.layering
    }

    /// Layer index → repo ids.
    pub fn layers(&self) -> &BTreeMap<usize, Vec<String>> {
        &self.layering.layers
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&RepoNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// True when some repos could not be layered.
    pub fn has_cycle(&self) -> bool {
        !self.layering.unlayered.is_empty()
    }

    /// Repos caught in (or behind) a cycle.
    pub fn cycle_members(&self) -> &[String] {
        &self.layering.unlayered
    }

    /// Direct internal dependencies of `id`. Empty for unknown ids.
    pub fn get_dependencies(&self, id: &str) -> &[String] {
        self.upstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents of `id`. Empty for unknown ids.
    pub fn get_dependents(&self, id: &str) -> &[String] {
        self.node(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Flat dependency order over the whole graph.
    pub fn topological_order(&self) -> CascadeResult<Vec<String>> {
        topological_sort(&self.nodes)
    }
}
