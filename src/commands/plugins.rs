//! # Plugins Command Implementation
//!
//! Downloads the `plugins` configured for a directory into the plugin
//! directory. Each plugin is tried at its platform-specific URL first and
//! skipped when the stored ETag shows it is unchanged.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use tfstage::config;
use tfstage::defaults;
use tfstage::output::{emoji, OutputConfig};
use tfstage::plugins::{download_plugins, DownloadStatus, HttpFetcher};

/// Download the plugins configured for a directory
#[derive(Args, Debug)]
pub struct PluginsArgs {
    /// Directory whose effective configuration lists the plugins
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Root of the configuration hierarchy (defaults to the git top level)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Directory the plugins are written to (defaults to ~/.terraform.d/plugins)
    #[arg(long, value_name = "DIR")]
    pub plugin_dir: Option<PathBuf>,
}

/// Execute the `plugins` command.
pub fn execute(args: PluginsArgs, color_flag: &str) -> Result<i32> {
    let out = OutputConfig::from_env_and_flag(color_flag);

    let dir = std::fs::canonicalize(&args.path)
        .with_context(|| format!("Directory not found: {}", args.path.display()))?;
    let root = match &args.root {
        Some(root) => std::fs::canonicalize(root)
            .with_context(|| format!("Root directory not found: {}", root.display()))?,
        None => tfstage::git::toplevel(&dir).unwrap_or_else(|_| dir.clone()),
    };

    let config = config::resolve_for_directory(&root, &dir)?;
    if config.plugins.is_empty() {
        println!(
            "{} No plugins configured for {}",
            emoji(&out, "💡", "[INFO]"),
            dir.display()
        );
        return Ok(0);
    }

    let plugin_dir = args.plugin_dir.unwrap_or_else(defaults::default_plugin_dir);
    let statuses = download_plugins(&HttpFetcher::new(), &config.plugins, &plugin_dir)?;

    for (name, status) in statuses {
        match status {
            DownloadStatus::Downloaded => {
                println!("{} Downloaded {}", emoji(&out, "⬇️", "[GET]"), name)
            }
            DownloadStatus::Unchanged => {
                println!("{} {} is up to date", emoji(&out, "✅", "[OK]"), name)
            }
        }
    }
    Ok(0)
}
