//! Dependency graph over parts: deterministic topological order, closure
//! over transitive dependencies, cycle detection.

use std::collections::{HashMap, HashSet};

use crate::errors::ConfigError;
use crate::part::PartSpec;

/// Index into the part list.
pub type PartIndex = usize;

/// A directed acyclic graph of parts, built from each part's `after` list.
pub struct PartGraph {
    parts: Vec<PartSpec>,
    index_map: HashMap<String, PartIndex>,
    /// index -> parts that depend on it
    forward_edges: Vec<Vec<PartIndex>>,
    /// index -> parts it depends on
    reverse_edges: Vec<Vec<PartIndex>>,
    /// A topological order, ties broken by part name, computed once at
    /// construction so every consumer sees the same deterministic order.
    topo_order: Vec<PartIndex>,
}

impl PartGraph {
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn part(&self, index: PartIndex) -> &PartSpec {
        &self.parts[index]
    }

    pub fn parts(&self) -> &[PartSpec] {
        &self.parts
    }

    pub fn index_of(&self, name: &str) -> Option<PartIndex> {
        self.index_map.get(name).copied()
    }

    pub fn dependents(&self, index: PartIndex) -> &[PartIndex] {
        &self.forward_edges[index]
    }

    pub fn dependencies(&self, index: PartIndex) -> &[PartIndex] {
        &self.reverse_edges[index]
    }

    /// The deterministic topological order computed at construction time.
    pub fn topological_order(&self) -> &[PartIndex] {
        &self.topo_order
    }

    /// The transitive closure of dependencies reachable from `seeds`,
    /// including the seeds themselves.
    pub fn closure(&self, seeds: &[PartIndex]) -> HashSet<PartIndex> {
        let mut seen: HashSet<PartIndex> = seeds.iter().copied().collect();
        let mut stack: Vec<PartIndex> = seeds.to_vec();
        while let Some(index) = stack.pop() {
            for &dep in self.dependencies(index) {
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        seen
    }

    /// Build the graph from a set of already-validated parts (dependency
    /// names already checked against the full part list).
    pub fn build(parts: Vec<PartSpec>) -> Result<PartGraph, ConfigError> {
        let mut index_map = HashMap::new();
        for (i, part) in parts.iter().enumerate() {
            index_map.insert(part.name.clone(), i);
        }

        let mut forward_edges: Vec<Vec<PartIndex>> = vec![Vec::new(); parts.len()];
        let mut reverse_edges: Vec<Vec<PartIndex>> = vec![Vec::new(); parts.len()];
        for (to_idx, part) in parts.iter().enumerate() {
            for dep in &part.after {
                let from_idx = *index_map
                    .get(dep)
                    .expect("dependency names are validated before graph construction");
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }
        // Keep edge lists name-ordered so any iteration over them is itself
        // deterministic, independent of the topo sort below.
        for edges in forward_edges.iter_mut().chain(reverse_edges.iter_mut()) {
            edges.sort_by_key(|&i| parts[i].name.clone());
        }

        let topo_order = topological_sort(&parts, &reverse_edges, &forward_edges)?;

        Ok(PartGraph {
            parts,
            index_map,
            forward_edges,
            reverse_edges,
            topo_order,
        })
    }
}

/// Kahn's algorithm with a min-heap-by-name tiebreak: among all
/// currently-ready nodes, always pick the lexicographically smallest name.
/// This makes the resulting order a pure function of the part names and
/// edges, never of input iteration order.
fn topological_sort(
    parts: &[PartSpec],
    reverse_edges: &[Vec<PartIndex>],
    forward_edges: &[Vec<PartIndex>],
) -> Result<Vec<PartIndex>, ConfigError> {
    let mut in_degree: Vec<usize> = reverse_edges.iter().map(Vec::len).collect();
    let mut ready: Vec<PartIndex> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();
    ready.sort_by_key(|&i| parts[i].name.clone());

    let mut order = Vec::with_capacity(parts.len());
    while !ready.is_empty() {
        // `ready` is kept sorted by name; take the smallest.
        let index = ready.remove(0);
        order.push(index);
        let mut newly_ready = Vec::new();
        for &dependent in &forward_edges[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                newly_ready.push(dependent);
            }
        }
        ready.extend(newly_ready);
        ready.sort_by_key(|&i| parts[i].name.clone());
    }

    if order.len() != parts.len() {
        let mut cycle: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| parts[i].name.clone())
            .collect();
        cycle.sort();
        return Err(ConfigError::CircularDependency { cycle });
    }

    Ok(order)
}
