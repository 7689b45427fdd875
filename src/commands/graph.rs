//! # Graph Command Implementation
//!
//! Prints the execution levels of a directory tree, either as a `ptree` tree
//! or as JSON with the levels and the dependency edges. Read-only: the tool
//! is never invoked.

use anyhow::Result;
use clap::Args;
use ptree::{print_tree, TreeItem};
use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};

use tfstage::output::display_path;
use tfstage::phases::discovery::PipelineDefinition;
use tfstage::phases::orchestrator::{self, RunPlan};

/// Display the dependency levels
#[derive(Args, Debug)]
pub struct GraphArgs {
    /// Root directory to scan
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// YAML pipeline definition adding stage-to-stage dependencies
    #[arg(long, value_name = "FILE", env = "TFSTAGE_PIPELINE")]
    pub pipeline: Option<PathBuf>,

    /// Print levels and edges as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct GraphReport {
    root: PathBuf,
    levels: Vec<Vec<String>>,
    edges: Vec<(String, String)>,
}

impl GraphReport {
    fn new(plan: &RunPlan) -> Self {
        let root = &plan.discovered.root;
        Self {
            root: root.clone(),
            levels: plan
                .levels
                .iter()
                .map(|level| level.iter().map(|dir| display_path(root, dir)).collect())
                .collect(),
            edges: plan
                .discovered
                .graph
                .edges()
                .map(|(before, after)| (display_path(root, before), display_path(root, after)))
                .collect(),
        }
    }
}

/// Execute the `graph` command.
pub fn execute(args: GraphArgs, _color_flag: &str) -> Result<i32> {
    let pipeline = args
        .pipeline
        .as_deref()
        .map(PipelineDefinition::load)
        .transpose()?;
    let plan = orchestrator::plan_run(&args.path, pipeline.as_ref())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&GraphReport::new(&plan))?);
    } else {
        print_tree(&level_tree(&plan.discovered.root, &plan))?;
    }
    Ok(0)
}

fn level_tree(root: &Path, plan: &RunPlan) -> TreeNode {
    let children = plan
        .levels
        .iter()
        .enumerate()
        .map(|(index, level)| TreeNode {
            label: format!("Level {}", index),
            children: level
                .iter()
                .map(|dir| TreeNode {
                    label: display_path(root, dir),
                    children: vec![],
                })
                .collect(),
        })
        .collect();

    TreeNode {
        label: root.display().to_string(),
        children,
    }
}

/// Tree node structure for ptree visualization
#[derive(Clone)]
struct TreeNode {
    label: String,
    children: Vec<TreeNode>,
}

impl TreeItem for TreeNode {
    type Child = TreeNode;

    fn write_self<W: std::io::Write>(
        &self,
        f: &mut W,
        _style: &ptree::Style,
    ) -> std::io::Result<()> {
        write!(f, "{}", self.label)
    }

    fn children(&self) -> Cow<'_, [Self::Child]> {
        Cow::Borrowed(&self.children)
    }
}
