//! Orchestrator for a complete run
//!
//! Coordinates the phases for one invocation:
//! 1. Discover directories and edges
//! 2. Reject cycles and partition into levels
//! 3. Resolve secrets and backend arguments for the selected directories
//! 4. Execute the levels
//!
//! Everything that can fail for configuration reasons happens in phases 1-3,
//! so a bad configuration aborts the run before any directory is touched.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::info;

use super::discovery::{self, Discovered, PipelineDefinition};
use super::execution::{self, ExecutionOptions, ExecutionSummary};
use super::{ordering, preparation};
use crate::backend::INHERITED_VARS_SUFFIX;
use crate::config;
use crate::error::Result;
use crate::graph::ExecutionLevels;
use crate::runner::ResilientRunner;
use crate::secrets::SecretStore;

/// Discovered graph and its schedule
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub discovered: Discovered,
    pub levels: ExecutionLevels,
}

/// Phases 1 and 2: discover and schedule.
pub fn plan_run(root: &Path, pipeline: Option<&PipelineDefinition>) -> Result<RunPlan> {
    let discovered = discovery::execute(root, pipeline)?;
    let levels = ordering::execute(&discovered.graph)?;
    info!(
        "Discovered {} directories ({} dependencies) in {} levels",
        discovered.graph.len(),
        discovered.graph.edge_count(),
        levels.len()
    );
    Ok(RunPlan { discovered, levels })
}

/// Which directories to run
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Only directories at or below this path
    pub target: Option<PathBuf>,
    /// Only directories touched by these files, plus their dependents
    pub changed_files: Option<BTreeSet<PathBuf>>,
}

impl Selection {
    pub fn is_all(&self) -> bool {
        self.target.is_none() && self.changed_files.is_none()
    }
}

/// Directories selected by `selection`, or `None` when everything runs.
///
/// A changed file selects the node containing it. A changed wrapper config or
/// inherited variable file also selects every node below its directory. The
/// selection then grows to everything that depends on a selected node, and
/// finally is narrowed to the target prefix.
pub fn select(plan: &RunPlan, selection: &Selection) -> Option<BTreeSet<PathBuf>> {
    if selection.is_all() {
        return None;
    }
    let graph = &plan.discovered.graph;

    let mut selected: BTreeSet<PathBuf> = match &selection.changed_files {
        Some(files) => {
            let mut touched = BTreeSet::new();
            for file in files {
                let Some(dir) = file.parent() else {
                    continue;
                };
                let inherited = file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        config::is_config_file_name(name) || name.ends_with(INHERITED_VARS_SUFFIX)
                    });
                for node in graph.nodes() {
                    if node == dir || (inherited && node.starts_with(dir)) {
                        touched.insert(node.clone());
                    }
                }
            }
            graph.with_dependents(&touched)
        }
        None => graph.nodes().cloned().collect(),
    };

    if let Some(target) = &selection.target {
        selected.retain(|node| node.starts_with(target));
    }
    Some(selected)
}

/// Phases 3 and 4 for an existing plan.
pub fn execute_plan(
    plan: &RunPlan,
    repo_name: &str,
    store: &dyn SecretStore,
    runner: &ResilientRunner,
    options: &ExecutionOptions,
) -> Result<ExecutionSummary> {
    let selected: Vec<&PathBuf> = plan
        .discovered
        .graph
        .nodes()
        .filter(|node| {
            options
                .selection
                .as_ref()
                .map_or(true, |selection| selection.contains(*node))
        })
        .collect();

    let settings = preparation::execute(&plan.discovered, selected, repo_name, store)?;
    let levels = ordering::for_command(plan.levels.clone(), &options.command);
    execution::execute(&levels, &settings, runner, options)
}

/// Run `options.command` over every directory under `root`.
pub fn execute_run(
    root: &Path,
    pipeline: Option<&PipelineDefinition>,
    repo_name: Option<&str>,
    store: &dyn SecretStore,
    runner: &ResilientRunner,
    options: &ExecutionOptions,
) -> Result<ExecutionSummary> {
    let plan = plan_run(root, pipeline)?;
    let repo_name = repo_name
        .map(str::to_string)
        .unwrap_or_else(|| preparation::default_repo_name(&plan.discovered.repo_root));
    execute_plan(&plan, &repo_name, store, runner, options)
}
