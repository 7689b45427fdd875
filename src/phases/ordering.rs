//! Phase 2: Ordering
//!
//! Turns the discovered graph into the execution schedule. A cycle is a
//! configuration error and aborts the run before anything is executed;
//! otherwise the graph is layered breadth-first from its source nodes.
//!
//! `destroy` walks the schedule backwards so that dependents are torn down
//! before the directories they depend on.

use log::debug;

use crate::error::{Error, Result};
use crate::graph::{find_cycle, level_partition, source_nodes, DependencyGraph, ExecutionLevels};

/// Execute Phase 2: check for cycles and partition into levels.
pub fn execute(graph: &DependencyGraph) -> Result<ExecutionLevels> {
    if let Some(nodes) = find_cycle(graph) {
        return Err(Error::CycleDetected { nodes });
    }

    let sources = source_nodes(graph);
    let levels = level_partition(&sources, graph);
    debug!(
        "Scheduled {} directories in {} levels",
        levels.node_count(),
        levels.len()
    );
    Ok(levels)
}

/// The schedule in the order `command` must run it
pub fn for_command(levels: ExecutionLevels, command: &str) -> ExecutionLevels {
    if command == "destroy" {
        let mut levels = levels;
        levels.levels.reverse();
        levels
    } else {
        levels
    }
}
