//! Phase 1: Discovery
//!
//! Builds the [`DependencyGraph`] for a scan root. Discovery has three steps:
//!
//! 1.  **Candidates**: every directory under the root holding at least one
//!     `*.tf` file becomes a node, unless its effective configuration sets
//!     `plan_check: false`. Tool caches (`.terraform`) and `.git` are never
//!     entered. Symlinked directories are candidates but are not descended
//!     into.
//!
//! 2.  **Pipeline stages**: directories named by a pipeline definition are
//!     added as nodes even when they are not candidates.
//!
//! 3.  **Edges**: four independent signals, merged into one graph. Each edge
//!     points from the directory that must run first to the one that depends
//!     on it:
//!     - symlinks: a symlinked directory, or a directory holding a symlinked
//!       file, depends on the directory the link resolves into
//!     - module references: `source = "../x"` depends on `../x`
//!     - inherited variables: a directory depends on every ancestor holding
//!       an `*.auto.tfvars` file
//!     - pipeline stages: every directory of stage N runs before every
//!       directory of stage N+1
//!
//! Edges whose endpoints are not both nodes are dropped. Edge scanning runs in
//! parallel with rayon; the ordered adjacency sets make the result
//! independent of scheduling.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use log::{debug, warn};
use rayon::prelude::*;
use regex::Regex;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::backend::INHERITED_VARS_SUFFIX;
use crate::config::{self, WrapperConfig};
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;

/// Directory names never descended into
pub const SKIPPED_DIRS: &[&str] = &[".terraform", ".git"];

const SOURCE_EXTENSION: &str = "tf";

/// One stage of a pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineStage {
    pub name: String,
    /// Paths or glob patterns relative to the scan root
    pub directories: Vec<String>,
}

/// Explicit ordering of directories into stages
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub stages: Vec<PipelineStage>,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::Pipeline {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::Pipeline {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Expand every stage to existing directories under `root`.
    ///
    /// Globs expand in lexical order. Entries matching no directory are
    /// skipped with a warning.
    pub fn expand(&self, root: &Path) -> Result<Vec<Vec<PathBuf>>> {
        let mut stages = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let mut directories = BTreeSet::new();
            for entry in &stage.directories {
                let matched = expand_entry(root, entry)?;
                if matched.is_empty() {
                    warn!(
                        "Pipeline stage '{}': '{}' matches no directory, skipping",
                        stage.name, entry
                    );
                }
                directories.extend(matched);
            }
            stages.push(directories.into_iter().collect());
        }
        Ok(stages)
    }
}

fn expand_entry(root: &Path, entry: &str) -> Result<Vec<PathBuf>> {
    let trimmed = entry.trim_end_matches('/');
    if !trimmed.contains(['*', '?', '[']) {
        let path = normalize(&root.join(trimmed));
        return Ok(if path.is_dir() { vec![path] } else { Vec::new() });
    }

    let pattern = root.join(trimmed);
    let paths = glob::glob(&pattern.to_string_lossy()).map_err(Error::Glob)?;
    Ok(paths
        .filter_map(|path| path.ok())
        .filter(|path| path.is_dir())
        .map(|path| normalize(&path))
        .collect())
}

/// Result of discovery: the graph plus the effective configuration of every
/// node.
#[derive(Debug, Clone)]
pub struct Discovered {
    /// Scan root; candidates are searched below it
    pub root: PathBuf,
    /// Repository root; configuration chains and state keys start here
    pub repo_root: PathBuf,
    pub graph: DependencyGraph,
    pub configs: BTreeMap<PathBuf, WrapperConfig>,
}

/// Root of the repository containing `root`: the git top level, or `root`
/// itself outside a git work tree.
pub fn repository_root(root: &Path) -> PathBuf {
    crate::git::toplevel(root)
        .ok()
        .filter(|top| root.starts_with(top))
        .unwrap_or_else(|| root.to_path_buf())
}

/// Execute Phase 1: discover nodes and edges under `root`.
pub fn execute(root: &Path, pipeline: Option<&PipelineDefinition>) -> Result<Discovered> {
    let root = fs::canonicalize(root)?;
    let repo_root = repository_root(&root);
    debug!("Repository root: {}", repo_root.display());
    let mut graph = DependencyGraph::new();
    let mut configs = BTreeMap::new();

    for dir in find_candidates(&root) {
        let config = config::resolve_for_directory(&repo_root, &dir)?;
        if !config.plan_check {
            debug!("Skipping {} (plan_check: false)", dir.display());
            continue;
        }
        graph.add_node(dir.clone());
        configs.insert(dir, config);
    }

    let stages = match pipeline {
        Some(pipeline) => pipeline.expand(&root)?,
        None => Vec::new(),
    };
    for dir in stages.iter().flatten() {
        if !graph.contains(dir) {
            let config = config::resolve_for_directory(&repo_root, dir)?;
            graph.add_node(dir.clone());
            configs.insert(dir.clone(), config);
        }
    }

    let nodes: Vec<PathBuf> = graph.nodes().cloned().collect();
    let edges: Vec<(PathBuf, PathBuf)> = nodes
        .par_iter()
        .flat_map_iter(|dir| {
            let mut edges = symlink_edges(dir);
            edges.extend(reference_edges(dir));
            edges.extend(inheritance_edges(&repo_root, dir));
            edges
        })
        .collect();

    for (before, after) in &edges {
        if graph.add_edge(before, after) {
            debug!("{} -> {}", before.display(), after.display());
        }
    }

    for pair in stages.windows(2) {
        for before in &pair[0] {
            for after in &pair[1] {
                graph.add_edge(before, after);
            }
        }
    }

    Ok(Discovered {
        root,
        repo_root,
        graph,
        configs,
    })
}

/// Directories under `root` (inclusive) holding at least one `*.tf` file, in
/// lexical order.
pub fn find_candidates(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !SKIPPED_DIRS.contains(&e.file_name().to_str().unwrap_or_default())
        })
        // Entries that vanish mid-walk surface as errors
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() || (e.path_is_symlink() && e.path().is_dir()))
        .map(|e| e.into_path())
        .filter(|dir| has_source_files(dir))
        .collect()
}

fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    };
    entries.sort();
    entries
}

fn source_files(dir: &Path) -> Vec<PathBuf> {
    dir_entries(dir)
        .into_iter()
        .filter(|path| path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION))
        .filter(|path| path.is_file())
        .collect()
}

fn has_source_files(dir: &Path) -> bool {
    !source_files(dir).is_empty()
}

/// Lexically resolve `.` and `..` components without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn symlink_edges(dir: &Path) -> Vec<(PathBuf, PathBuf)> {
    let mut edges = Vec::new();

    let is_link = fs::symlink_metadata(dir)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false);
    if is_link {
        if let Ok(target) = fs::canonicalize(dir) {
            edges.push((target, dir.to_path_buf()));
        }
    }

    for entry in dir_entries(dir) {
        let linked_file = fs::symlink_metadata(&entry)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
            && entry.is_file();
        if !linked_file {
            continue;
        }
        let Some(target_dir) = fs::canonicalize(&entry)
            .ok()
            .and_then(|target| target.parent().map(Path::to_path_buf))
        else {
            continue;
        };
        // A link to a sibling file is not a dependency
        if fs::canonicalize(dir).is_ok_and(|real| real == target_dir) {
            continue;
        }
        edges.push((target_dir, dir.to_path_buf()));
    }
    edges
}

fn module_source_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*source\s*=\s*"(\.\.?/[^"]*)""#).expect("valid regex")
    })
}

/// Relative module sources declared by the `*.tf` files in `dir`
pub fn module_references(dir: &Path) -> Vec<PathBuf> {
    let mut references = BTreeSet::new();
    for file in source_files(dir) {
        let Ok(content) = fs::read_to_string(&file) else {
            continue;
        };
        for line in content.lines() {
            if let Some(captures) = module_source_regex().captures(line) {
                references.insert(normalize(&dir.join(&captures[1])));
            }
        }
    }
    references.into_iter().collect()
}

fn reference_edges(dir: &Path) -> Vec<(PathBuf, PathBuf)> {
    module_references(dir)
        .into_iter()
        .flat_map(|referenced| {
            // A reference through a symlinked path also matches the real directory
            let canonical = fs::canonicalize(&referenced)
                .ok()
                .filter(|c| c != &referenced);
            std::iter::once(referenced)
                .chain(canonical)
                .map(|r| (r, dir.to_path_buf()))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn inheritance_edges(root: &Path, dir: &Path) -> Vec<(PathBuf, PathBuf)> {
    config::ancestor_dirs(root, dir)
        .into_iter()
        .filter(|ancestor| ancestor != dir)
        .filter(|ancestor| {
            dir_entries(ancestor).iter().any(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(INHERITED_VARS_SUFFIX))
            })
        })
        .map(|ancestor| (ancestor, dir.to_path_buf()))
        .collect()
}
