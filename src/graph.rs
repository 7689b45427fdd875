//! Directory dependency graph and its analyses.
//!
//! Nodes are directory paths. An edge `a -> b` means `a` must run before `b`
//! (`b` depends on `a`). Both adjacency directions are kept in ordered sets so
//! every traversal below is deterministic regardless of insertion order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Directed "must-run-before" graph over directories
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    successors: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    predecessors: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: impl Into<PathBuf>) {
        let node = node.into();
        self.predecessors.entry(node.clone()).or_default();
        self.successors.entry(node).or_default();
    }

    /// Record that `before` must run before `after`.
    ///
    /// Both endpoints must already be nodes; otherwise the edge is dropped and
    /// `false` is returned. A self-loop is kept and reported as a cycle.
    pub fn add_edge(&mut self, before: &Path, after: &Path) -> bool {
        if !self.contains(before) || !self.contains(after) {
            return false;
        }
        self.successors
            .entry(before.to_path_buf())
            .or_default()
            .insert(after.to_path_buf());
        self.predecessors
            .entry(after.to_path_buf())
            .or_default()
            .insert(before.to_path_buf());
        true
    }

    pub fn contains(&self, node: &Path) -> bool {
        self.successors.contains_key(node)
    }

    /// All nodes in lexical order
    pub fn nodes(&self) -> impl Iterator<Item = &PathBuf> {
        self.successors.keys()
    }

    pub fn len(&self) -> usize {
        self.successors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.successors.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.successors.values().map(BTreeSet::len).sum()
    }

    /// Nodes that must run after `node`
    pub fn successors(&self, node: &Path) -> impl DoubleEndedIterator<Item = &PathBuf> {
        self.successors.get(node).into_iter().flatten()
    }

    /// Nodes that must run before `node`
    pub fn predecessors(&self, node: &Path) -> impl Iterator<Item = &PathBuf> {
        self.predecessors.get(node).into_iter().flatten()
    }

    /// All edges as `(before, after)` pairs in lexical order
    pub fn edges(&self) -> impl Iterator<Item = (&PathBuf, &PathBuf)> {
        self.successors
            .iter()
            .flat_map(|(before, afters)| afters.iter().map(move |after| (before, after)))
    }

    /// `nodes` plus everything that transitively depends on them.
    pub fn with_dependents(&self, nodes: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        let mut reached: BTreeSet<PathBuf> = nodes
            .iter()
            .filter(|node| self.contains(node))
            .cloned()
            .collect();
        let mut queue: VecDeque<PathBuf> = reached.iter().cloned().collect();
        while let Some(node) = queue.pop_front() {
            for next in self.successors(&node) {
                if reached.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        reached
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Find one cycle, returned as the path of nodes around it with the first
/// node repeated at the end.
///
/// Iterative three-color depth-first search. Roots and successors are visited
/// in lexical order so the same graph always reports the same cycle.
pub fn find_cycle(graph: &DependencyGraph) -> Option<Vec<PathBuf>> {
    let mut color: BTreeMap<&PathBuf, Color> = graph.nodes().map(|n| (n, Color::White)).collect();

    for root in graph.nodes() {
        if color[root] != Color::White {
            continue;
        }

        // Stack of (node, remaining successors); the stack itself is the current path
        let mut stack: Vec<(&PathBuf, Vec<&PathBuf>)> = Vec::new();
        color.insert(root, Color::Grey);
        stack.push((root, graph.successors(root).rev().collect()));

        while let Some((node, pending)) = stack.last_mut() {
            let node = *node;
            match pending.pop() {
                Some(next) => match color[next] {
                    Color::White => {
                        color.insert(next, Color::Grey);
                        stack.push((next, graph.successors(next).rev().collect()));
                    }
                    Color::Grey => {
                        let start = stack
                            .iter()
                            .position(|(n, _)| *n == next)
                            .unwrap_or_default();
                        let mut cycle: Vec<PathBuf> =
                            stack[start..].iter().map(|(n, _)| (*n).clone()).collect();
                        cycle.push(next.clone());
                        return Some(cycle);
                    }
                    Color::Black => {}
                },
                None => {
                    color.insert(node, Color::Black);
                    stack.pop();
                }
            }
        }
    }
    None
}

pub fn has_cycle(graph: &DependencyGraph) -> bool {
    find_cycle(graph).is_some()
}

/// Nodes with no predecessors, lexically sorted
pub fn source_nodes(graph: &DependencyGraph) -> Vec<PathBuf> {
    graph
        .nodes()
        .filter(|node| graph.predecessors(node).next().is_none())
        .cloned()
        .collect()
}

/// Ordered execution levels; every predecessor of a node sits in an earlier
/// level and every node appears exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionLevels {
    pub levels: Vec<Vec<PathBuf>>,
}

impl ExecutionLevels {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Vec<PathBuf>> {
        self.levels.iter()
    }

    /// Index of the level containing `node`
    pub fn level_of(&self, node: &Path) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|n| n == node))
    }
}

/// Partition `graph` into levels by breadth-first layering from `sources`.
///
/// Level 0 is the source set. A node joins the first level after all of its
/// predecessors have been placed. Nodes never reached from `sources` (for
/// instance nodes on a cycle) are appended as one trailing level.
pub fn level_partition(sources: &[PathBuf], graph: &DependencyGraph) -> ExecutionLevels {
    let mut placed: BTreeSet<&PathBuf> = BTreeSet::new();
    let mut levels: Vec<Vec<PathBuf>> = Vec::new();

    let mut current: BTreeSet<&PathBuf> = sources
        .iter()
        .filter_map(|source| graph.successors.get_key_value(source).map(|(k, _)| k))
        .collect();

    while !current.is_empty() {
        placed.extend(current.iter().copied());
        levels.push(current.iter().map(|n| (*n).clone()).collect());

        current = current
            .iter()
            .flat_map(|node| graph.successors(node))
            .filter(|next| !placed.contains(next))
            .filter(|next| graph.predecessors(next).all(|p| placed.contains(p)))
            .collect();
    }

    let remaining: Vec<PathBuf> = graph
        .nodes()
        .filter(|node| !placed.contains(node))
        .cloned()
        .collect();
    if !remaining.is_empty() {
        levels.push(remaining);
    }

    ExecutionLevels { levels }
}
