//! # tfstage
//!
//! Runs terraform across every directory of a monorepo in dependency order.
//! Directories are discovered, linked by the dependencies they declare,
//! partitioned into levels and executed level by level on a bounded worker
//! pool, with automatic repair of common state-lock and state-storage
//! failures.
//!
//! ## Quick Example
//!
//! ```
//! use std::path::Path;
//! use tfstage::graph::{level_partition, source_nodes, DependencyGraph};
//!
//! let mut graph = DependencyGraph::new();
//! for dir in ["/infra/network", "/infra/database", "/infra/app"] {
//!     graph.add_node(dir);
//! }
//! graph.add_edge(Path::new("/infra/network"), Path::new("/infra/database"));
//! graph.add_edge(Path::new("/infra/database"), Path::new("/infra/app"));
//!
//! let levels = level_partition(&source_nodes(&graph), &graph);
//! assert_eq!(levels.len(), 3);
//! assert_eq!(levels.level_of(Path::new("/infra/app")), Some(2));
//! ```
//!
//! ## Core Concepts
//!
//! - **Configuration (`config`, `secrets`)**: hierarchical `.tf_wrapper`
//!   files merged root-most first into one effective configuration per
//!   directory; secret references resolved through a per-run cache.
//! - **Dependency graph (`graph`)**: directories and "must run before"
//!   edges, cycle detection and level partitioning.
//! - **Runner (`runner`, `tool`, `lock_table`)**: invokes the tool,
//!   classifies its output and repairs stale locks, digest mismatches and
//!   failed state uploads before retrying.
//! - **Phases (`phases`)**: discovery, ordering, preparation and execution,
//!   wired together by `phases::orchestrator`.
//!
//! Configuration errors and dependency cycles are detected before the first
//! directory is executed.

pub mod backend;
pub mod config;
pub mod defaults;
pub mod error;
pub mod git;
pub mod graph;
pub mod lock_table;
pub mod output;
pub mod phases;
pub mod plugins;
pub mod runner;
pub mod secrets;
pub mod tool;

#[cfg(test)]
mod graph_proptest;
#[cfg(test)]
mod testing;
