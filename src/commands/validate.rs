//! # Validate Command Implementation
//!
//! Checks a directory tree without invoking the tool:
//!
//! - **Configuration**: every wrapper config in every chain parses strictly
//! - **Pipeline**: the pipeline definition, when given, parses and expands
//! - **Cycles**: the dependency graph has no cycle
//! - **Backends**: each directory declares a backend unless `backend_check`
//!   is off, and the backend arguments can be computed
//!
//! Exits 0 when everything is valid and 1 otherwise.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use tfstage::backend;
use tfstage::output::{display_path, emoji, OutputConfig};
use tfstage::phases::discovery::PipelineDefinition;
use tfstage::phases::{discovery, ordering};

/// Validate configuration and dependencies without running anything
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Root directory to scan
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// YAML pipeline definition adding stage-to-stage dependencies
    #[arg(long, value_name = "FILE", env = "TFSTAGE_PIPELINE")]
    pub pipeline: Option<PathBuf>,
}

/// Execute the `validate` command.
pub fn execute(args: ValidateArgs, color_flag: &str) -> Result<i32> {
    let out = OutputConfig::from_env_and_flag(color_flag);
    let ok = emoji(&out, "✅", "[OK]");
    let err = emoji(&out, "❌", "[ERR]");

    println!(
        "{} Validating {}",
        emoji(&out, "🔍", "[SCAN]"),
        args.path.display()
    );

    let pipeline = match args.pipeline.as_deref().map(PipelineDefinition::load) {
        Some(Ok(pipeline)) => Some(pipeline),
        Some(Err(e)) => {
            println!("{} {}", err, e);
            return Ok(1);
        }
        None => None,
    };

    let discovered = match discovery::execute(&args.path, pipeline.as_ref()) {
        Ok(discovered) => {
            println!(
                "{} Found {} directories with {} dependencies",
                ok,
                discovered.graph.len(),
                discovered.graph.edge_count()
            );
            discovered
        }
        Err(e) => {
            println!("{} {}", err, e);
            return Ok(1);
        }
    };

    match ordering::execute(&discovered.graph) {
        Ok(levels) => println!("{} No dependency cycles ({} levels)", ok, levels.len()),
        Err(e) => {
            println!("{} {}", err, e);
            return Ok(1);
        }
    }

    let root = &discovered.root;
    let mut problems = 0;
    for (dir, config) in &discovered.configs {
        if let Err(e) = backend::backend_settings(&discovered.repo_root, "validate", dir, config) {
            println!("{} {}: {}", err, display_path(root, dir), e);
            problems += 1;
        }
    }

    if problems == 0 {
        println!("{} Backend configuration valid", ok);
        println!("\n{} Validation passed", emoji(&out, "🎉", "[DONE]"));
        Ok(0)
    } else {
        println!("\n{} {} directories failed validation", err, problems);
        Ok(1)
    }
}
