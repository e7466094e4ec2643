//! Affected-set analysis: everything downstream of a changed repo.
//!
//! Reachability is a breadth-first walk over `dependents` with a visited set
//! seeded with the source. Each reached repo is then placed one layer above
//! its deepest affected dependency, so a repo never shares a layer with (or
//! precedes) anything it depends on inside the cascade.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::graph::layers::DependencyGraph;

/// One repo reached from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedNode {
    pub id: String,
    /// Relative layer; direct dependents with no other affected
    /// dependency are 1.
    pub layer: usize,
    /// Source → ... → `id` through the dependency that fixed the layer.
    pub dependency_path: Vec<String>,
}

/// Transitive dependents of a source repo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedResult {
    pub source_id: String,
    /// Ordered by layer, then discovery order.
    pub affected: Vec<AffectedNode>,
    pub total_count: usize,
    /// Affected repos (and the source) that sit on a dependency cycle inside
    /// the affected set. Their layers are BFS distances.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cycle_members: Vec<String>,
}

impl AffectedResult {
    /// Deepest relative layer reached (0 when nothing is affected).
    pub fn max_layer(&self) -> usize {
        self.affected.iter().map(|a| a.layer).max().unwrap_or(0)
    }

    pub fn get(&self, id: &str) -> Option<&AffectedNode> {
        self.affected.iter().find(|a| a.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.affected.is_empty()
    }

    pub fn has_cycle(&self) -> bool {
        !self.cycle_members.is_empty()
    }
}

type Placement = (usize, Vec<String>);

impl DependencyGraph {
    /// All transitive dependents of `source_id`, each reported once.
    ///
    /// Unknown sources yield an empty result. Repos caught in a cycle inside
    /// the affected set fall back to their BFS distance and path.
    pub fn get_affected(&self, source_id: &str) -> AffectedResult {
        let mut result = AffectedResult {
            source_id: source_id.to_string(),
            ..Default::default()
        };
        if self.node(source_id).is_none() {
            return result;
        }

        let (discovered, bfs) = self.reachable_from(source_id);
        let layered = self.place_by_longest_path(source_id, &discovered);

        let mut affected: Vec<(usize, AffectedNode)> = discovered
            .iter()
            .enumerate()
            .map(|(order, id)| {
                let (layer, dependency_path) = layered
                    .get(id)
                    .or_else(|| bfs.get(id))
                    .cloned()
                    .unwrap_or_default();
                (
                    order,
                    AffectedNode {
                        id: id.to_string(),
                        layer,
                        dependency_path,
                    },
                )
            })
            .collect();
        affected.sort_by_key(|(order, n)| (n.layer, *order));

        // The source is on a cycle iff one of its own dependencies is downstream of it.
        let reached: HashSet<&str> = discovered.iter().copied().collect();
        if self
            .get_dependencies(source_id)
            .iter()
            .any(|d| reached.contains(d.as_str()))
        {
            result.cycle_members.push(source_id.to_string());
        }
        result.cycle_members.extend(
            discovered
                .iter()
                .filter(|id| !layered.contains_key(*id))
                .map(|id| id.to_string()),
        );

        result.affected = affected.into_iter().map(|(_, n)| n).collect();
        result.total_count = result.affected.len();
        result
    }

    /// BFS over dependents: discovery order plus BFS distance/path per repo.
    fn reachable_from<'a>(
        &'a self,
        source_id: &'a str,
    ) -> (Vec<&'a str>, HashMap<&'a str, Placement>) {
        let mut visited: HashSet<&str> = HashSet::from([source_id]);
        let mut discovered = Vec::new();
        let mut bfs: HashMap<&str, Placement> = HashMap::new();
        let mut queue: VecDeque<(&str, usize, Vec<String>)> = VecDeque::new();
        queue.push_back((source_id, 0, vec![source_id.to_string()]));

        while let Some((current, distance, path)) = queue.pop_front() {
            for dependent in self.get_dependents(current) {
                if !visited.insert(dependent.as_str()) {
                    continue;
                }
                let mut dependency_path = path.clone();
                dependency_path.push(dependent.clone());
                discovered.push(dependent.as_str());
                bfs.insert(dependent.as_str(), (distance + 1, dependency_path.clone()));
                queue.push_back((dependent.as_str(), distance + 1, dependency_path));
            }
        }
        (discovered, bfs)
    }

    /// Kahn peeling over the affected subgraph, tracking the deepest
    /// predecessor of each repo. Repos stuck behind a cycle are omitted.
    fn place_by_longest_path<'a>(
        &'a self,
        source_id: &'a str,
        discovered: &[&'a str],
    ) -> HashMap<&'a str, Placement> {
        let members: HashSet<&str> = discovered
            .iter()
            .copied()
            .chain(std::iter::once(source_id))
            .collect();
        let mut in_degree: HashMap<&str, usize> = discovered
            .iter()
            .map(|&id| {
                let deg = self
                    .get_dependencies(id)
                    .iter()
                    .filter(|d| members.contains(d.as_str()))
                    .count();
                (id, deg)
            })
            .collect();

        let mut best: HashMap<&str, Placement> = HashMap::new();
        let mut placed: HashMap<&str, Placement> = HashMap::new();
        placed.insert(source_id, (0, vec![source_id.to_string()]));
        let mut queue: VecDeque<&str> = VecDeque::from([source_id]);

        while let Some(current) = queue.pop_front() {
            let Some((layer, path)) = placed.get(current).cloned() else {
                continue;
            };
            for dependent in self.get_dependents(current) {
                let Some(deg) = in_degree.get_mut(dependent.as_str()) else {
                    continue;
                };
                let candidate = layer + 1;
                let improves = best
                    .get(dependent.as_str())
                    .map_or(true, |(existing, _)| candidate > *existing);
                if improves {
                    let mut through = path.clone();
                    through.push(dependent.clone());
                    best.insert(dependent.as_str(), (candidate, through));
                }
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    if let Some(p) = best.remove(dependent.as_str()) {
                        placed.insert(dependent.as_str(), p);
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        placed.remove(source_id);
        placed
    }
}
