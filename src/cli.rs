//! CLI argument parsing and command dispatch

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::commands;

/// tfstage - Run terraform across a monorepo in dependency order
#[derive(Parser, Debug)]
#[command(name = "tfstage")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Colorize output (always, never, auto)
    #[arg(long, global = true, value_name = "WHEN", default_value = "auto")]
    color: String,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run plan, apply or destroy over every directory, level by level
    Run(commands::run::RunArgs),

    /// Show the discovered dependency levels
    Graph(commands::graph::GraphArgs),

    /// Check configuration, backends and dependencies without running anything
    Validate(commands::validate::ValidateArgs),

    /// Download the plugins configured for a directory
    Plugins(commands::plugins::PluginsArgs),

    /// Generate shell completion scripts
    Completions(commands::completions::CompletionsArgs),
}

impl Cli {
    /// Execute the CLI command, returning the process exit code.
    pub fn execute(self) -> Result<i32> {
        init_logging(&self.log_level);
        let color = self.color.as_str();

        match self.command {
            Commands::Run(args) => commands::run::execute(args, color),
            Commands::Graph(args) => commands::graph::execute(args, color),
            Commands::Validate(args) => commands::validate::execute(args, color),
            Commands::Plugins(args) => commands::plugins::execute(args, color),
            Commands::Completions(args) => commands::completions::execute(args),
        }
    }
}

fn init_logging(level: &str) {
    let filter = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Warn);
    env_logger::Builder::new()
        .filter_level(filter)
        .format_timestamp(None)
        .init();
}
