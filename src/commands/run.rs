//! # Run Command Implementation
//!
//! Implements `tfstage run <plan|apply|destroy> [PATH]`, the main entry point.
//!
//! ## Process
//!
//! 1. Discover directories and dependencies below `PATH`, reject cycles
//! 2. Narrow the run to `--target` and/or the files changed since
//!    `--changed-since`, always including dependents of changed directories
//! 3. Ask for confirmation before `apply` and `destroy` unless `--yes`
//! 4. Resolve secrets and backend settings, then execute level by level
//! 5. Print each directory's output and a summary
//!
//! The exit code reflects the most severe outcome: 0 for success or pending
//! changes, 2 for IAM-relevant changes, 3 when the tool failed somewhere.

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use dialoguer::{theme::ColorfulTheme, Confirm};
use std::path::PathBuf;
use std::sync::Arc;

use tfstage::defaults;
use tfstage::git;
use tfstage::lock_table::AwsDynamoLockTable;
use tfstage::output::{emoji, render_result, render_summary, OutputConfig};
use tfstage::phases::discovery::PipelineDefinition;
use tfstage::phases::execution::ExecutionOptions;
use tfstage::phases::orchestrator::{self, Selection};
use tfstage::phases::preparation;
use tfstage::runner::ResilientRunner;
use tfstage::secrets::AwsSsmStore;
use tfstage::tool::SubprocessTool;

/// Tool command run in every directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ToolCommand {
    Plan,
    Apply,
    Destroy,
}

impl ToolCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolCommand::Plan => "plan",
            ToolCommand::Apply => "apply",
            ToolCommand::Destroy => "destroy",
        }
    }

    fn modifies_infrastructure(self) -> bool {
        !matches!(self, ToolCommand::Plan)
    }
}

/// Run a tool command over every directory in dependency order
#[derive(Args, Debug)]
pub struct RunArgs {
    /// The command to run in each directory
    #[arg(value_enum)]
    pub command: ToolCommand,

    /// Root directory to scan
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Maximum number of directories run at once within a level
    #[arg(short, long, value_name = "N", env = "TFSTAGE_PARALLEL", default_value_t = defaults::PARALLEL)]
    pub parallel: usize,

    /// Program invoked in each directory
    #[arg(long, value_name = "PROGRAM", env = "TFSTAGE_TOOL", default_value = defaults::TOOL)]
    pub tool: PathBuf,

    /// YAML pipeline definition adding stage-to-stage dependencies
    #[arg(long, value_name = "FILE", env = "TFSTAGE_PIPELINE")]
    pub pipeline: Option<PathBuf>,

    /// Minutes after which a held state lock is force-released
    #[arg(long, value_name = "MINUTES", env = "TFSTAGE_LOCK_TIMEOUT", default_value_t = defaults::LOCK_TIMEOUT_MINUTES)]
    pub lock_timeout: i64,

    /// Only run directories at or below this path
    #[arg(long, value_name = "DIR")]
    pub target: Option<PathBuf>,

    /// Only run directories touched since this git revision, plus their dependents
    #[arg(long, value_name = "REV")]
    pub changed_since: Option<String>,

    /// Hide the output of directories without changes
    #[arg(long)]
    pub only_changed: bool,

    /// Run the tool with debug logging enabled
    #[arg(long)]
    pub debug: bool,

    /// Skip the confirmation prompt for apply and destroy
    #[arg(short, long)]
    pub yes: bool,

    /// Repository name used in state keys (defaults to the git origin name)
    #[arg(long, value_name = "NAME")]
    pub repo_name: Option<String>,

    /// Print the results as JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Extra arguments passed to the tool command
    #[arg(last = true, value_name = "TOOL_ARGS")]
    pub tool_args: Vec<String>,
}

/// Execute the `run` command.
pub fn execute(args: RunArgs, color_flag: &str) -> Result<i32> {
    let out = OutputConfig::from_env_and_flag(color_flag);
    out.apply();

    if args.parallel == 0 {
        bail!("--parallel must be at least 1");
    }

    let pipeline = args
        .pipeline
        .as_deref()
        .map(PipelineDefinition::load)
        .transpose()?;
    let plan = orchestrator::plan_run(&args.path, pipeline.as_ref())?;
    let root = plan.discovered.root.clone();

    let selection = build_selection(&args, &root)?;
    let selected = orchestrator::select(&plan, &selection);
    let count = selected
        .as_ref()
        .map_or(plan.discovered.graph.len(), |selected| selected.len());

    if count == 0 {
        println!(
            "{} Nothing to {}: no directories selected",
            emoji(&out, "💡", "[INFO]"),
            args.command.as_str()
        );
        return Ok(0);
    }

    if args.command.modifies_infrastructure() && !args.yes && !confirm(&args, count)? {
        println!("Aborted.");
        return Ok(1);
    }

    let repo_name = args
        .repo_name
        .clone()
        .unwrap_or_else(|| preparation::default_repo_name(&plan.discovered.repo_root));
    let runner = ResilientRunner::new(
        Arc::new(SubprocessTool::new(args.tool.clone())),
        Arc::new(AwsDynamoLockTable::new(None)),
    )
    .with_lock_timeout(chrono::Duration::minutes(args.lock_timeout));
    let store = AwsSsmStore::new(None);

    let options = ExecutionOptions {
        args: args.tool_args.clone(),
        parallel: args.parallel,
        only_changed: args.only_changed,
        debug: args.debug,
        selection: selected,
        progress: !args.no_progress && !args.json && console::Term::stderr().is_term(),
        ..ExecutionOptions::new(args.command.as_str())
    };

    let summary = orchestrator::execute_plan(&plan, &repo_name, &store, &runner, &options)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for result in &summary.results {
            print!("{}", render_result(&out, &root, result));
        }
        println!();
        print!("{}", render_summary(&out, &root, &summary));
    }

    Ok(summary.exit_code())
}

fn build_selection(args: &RunArgs, root: &std::path::Path) -> Result<Selection> {
    let target = args
        .target
        .as_ref()
        .map(|target| {
            std::fs::canonicalize(target)
                .with_context(|| format!("Target directory not found: {}", target.display()))
        })
        .transpose()?;

    let changed_files = args
        .changed_since
        .as_deref()
        .map(|base| {
            git::changed_files(root, base)
                .with_context(|| format!("Failed to list files changed since {}", base))
        })
        .transpose()?;

    Ok(Selection {
        target,
        changed_files,
    })
}

fn confirm(args: &RunArgs, count: usize) -> Result<bool> {
    if !console::user_attended() {
        bail!(
            "Refusing to {} without confirmation in a non-interactive session; pass --yes",
            args.command.as_str()
        );
    }

    let theme = ColorfulTheme::default();
    let confirmed = Confirm::with_theme(&theme)
        .with_prompt(format!(
            "Run {} in {} directories?",
            args.command.as_str(),
            count
        ))
        .default(false)
        .interact()?;
    Ok(confirmed)
}
