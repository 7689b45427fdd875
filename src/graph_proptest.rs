//! Property-based tests for the graph analyses.
//!
//! Random graphs are generated as node counts plus edge lists; forward-only
//! edges (lower index to higher index) give acyclic graphs.

#[cfg(test)]
mod proptest_tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use crate::graph::{find_cycle, level_partition, source_nodes, DependencyGraph};
    use proptest::prelude::*;

    fn node(i: usize) -> PathBuf {
        PathBuf::from(format!("/repo/d{:02}", i))
    }

    fn build(count: usize, edges: &[(usize, usize)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for i in 0..count {
            graph.add_node(node(i));
        }
        for (a, b) in edges {
            graph.add_edge(&node(a % count), &node(b % count));
        }
        graph
    }

    fn acyclic(count: usize, edges: &[(usize, usize)]) -> DependencyGraph {
        let forward: Vec<(usize, usize)> = edges
            .iter()
            .map(|(a, b)| (a % count, b % count))
            .filter(|(a, b)| a < b)
            .collect();
        build(count, &forward)
    }

    fn edge_list() -> impl Strategy<Value = Vec<(usize, usize)>> {
        prop::collection::vec((0usize..40, 0usize..40), 0..80)
    }

    proptest! {
        /// Property: every node appears in exactly one level
        #[test]
        fn partition_covers_every_node_once(count in 1usize..30, edges in edge_list()) {
            let graph = build(count, &edges);
            let levels = level_partition(&source_nodes(&graph), &graph);

            let mut seen = BTreeSet::new();
            for level in levels.iter() {
                for n in level {
                    prop_assert!(seen.insert(n.clone()), "{:?} placed twice", n);
                }
            }
            prop_assert_eq!(seen.len(), graph.len());
        }

        /// Property: in an acyclic graph every predecessor sits in an earlier level
        #[test]
        fn predecessors_run_in_earlier_levels(count in 1usize..30, edges in edge_list()) {
            let graph = acyclic(count, &edges);
            let levels = level_partition(&source_nodes(&graph), &graph);

            for (before, after) in graph.edges() {
                let b = levels.level_of(before).unwrap();
                let a = levels.level_of(after).unwrap();
                prop_assert!(b < a, "{:?} (level {}) must precede {:?} (level {})", before, b, after, a);
            }
        }

        /// Property: forward-only edges never form a cycle
        #[test]
        fn forward_edges_are_acyclic(count in 1usize..30, edges in edge_list()) {
            prop_assert!(find_cycle(&acyclic(count, &edges)).is_none());
        }

        /// Property: a reported cycle is closed and every step is an edge
        #[test]
        fn reported_cycles_are_real(count in 1usize..30, edges in edge_list()) {
            let graph = build(count, &edges);
            if let Some(cycle) = find_cycle(&graph) {
                prop_assert!(cycle.len() >= 2);
                prop_assert_eq!(cycle.first(), cycle.last());
                for pair in cycle.windows(2) {
                    prop_assert!(graph.successors(&pair[0]).any(|n| n == &pair[1]));
                }
            }
        }

        /// Property: levels are lexically ordered internally
        #[test]
        fn levels_are_sorted(count in 1usize..30, edges in edge_list()) {
            let graph = build(count, &edges);
            for level in level_partition(&source_nodes(&graph), &graph).iter() {
                let mut sorted = level.clone();
                sorted.sort();
                prop_assert_eq!(level, &sorted);
            }
        }
    }
}
