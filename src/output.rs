//! # Output Configuration
//!
//! Utilities for CLI output: colour and emoji support based on terminal
//! capabilities and user preferences, plus rendering of run results.
//!
//! ## Respecting User Preferences
//!
//! The module respects the following environment variables and flags:
//! - `--color=never|always|auto` - CLI flag for color control
//! - `NO_COLOR` - Disables colors when set (per https://no-color.org/)
//! - `CLICOLOR=0` - Disables colors
//! - `CLICOLOR_FORCE=1` - Forces colors even in non-TTY
//! - `TERM=dumb` - Disables colors for dumb terminals

use std::env;
use std::fmt::Write as _;
use std::path::Path;

use console::style;

use crate::phases::execution::{DirectoryResult, ExecutionSummary};
use crate::runner::Classification;

/// Output configuration for controlling colors and emojis.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Whether colors and emojis should be used in output.
    pub use_color: bool,
}

impl OutputConfig {
    /// Create an output configuration from environment and CLI flag.
    ///
    /// `color_flag` is the value of `--color`: "always", "never" or "auto".
    /// In auto mode colors are disabled by `NO_COLOR`, `CLICOLOR=0`,
    /// `TERM=dumb` or a non-TTY stdout (unless `CLICOLOR_FORCE=1`).
    pub fn from_env_and_flag(color_flag: &str) -> Self {
        let use_color = match color_flag.to_lowercase().as_str() {
            "always" => true,
            "never" => false,
            _ => Self::detect_color_support(),
        };

        Self { use_color }
    }

    fn detect_color_support() -> bool {
        // The presence of the variable (even if empty) disables colors
        if env::var_os("NO_COLOR").is_some() {
            return false;
        }

        if env::var("CLICOLOR").is_ok_and(|v| v == "0") {
            return false;
        }

        if env::var("CLICOLOR_FORCE").is_ok_and(|v| v != "0" && !v.is_empty()) {
            return true;
        }

        if env::var("TERM").is_ok_and(|v| v == "dumb") {
            return false;
        }

        console::Term::stdout().features().colors_supported()
    }

    /// Apply the setting to `console` styling globally.
    pub fn apply(&self) {
        console::set_colors_enabled(self.use_color);
        console::set_colors_enabled_stderr(self.use_color);
    }

    #[cfg(test)]
    pub fn with_color() -> Self {
        Self { use_color: true }
    }

    #[cfg(test)]
    pub fn without_color() -> Self {
        Self { use_color: false }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self::from_env_and_flag("auto")
    }
}

/// Returns the emoji when colors are enabled, the plain text otherwise.
pub fn emoji<'a>(config: &OutputConfig, emoji_str: &'a str, plain: &'a str) -> &'a str {
    if config.use_color {
        emoji_str
    } else {
        plain
    }
}

/// `path` relative to `root` for display, `.` for the root itself
pub fn display_path(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(relative) if relative.as_os_str().is_empty() => ".".to_string(),
        Ok(relative) => relative.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

fn marker(config: &OutputConfig, classification: Classification) -> String {
    let (icon, plain) = match classification {
        Classification::Success => ("✅", "[OK]"),
        Classification::DiffPresent => ("📝", "[CHANGES]"),
        Classification::IamChange => ("🔐", "[IAM]"),
        Classification::ToolFailure => ("❌", "[FAILED]"),
    };
    let text = emoji(config, icon, plain);
    match classification {
        Classification::Success => style(text).green().to_string(),
        Classification::DiffPresent => style(text).yellow().to_string(),
        Classification::IamChange => style(text).magenta().to_string(),
        Classification::ToolFailure => style(text).red().to_string(),
    }
}

/// Header and captured output of one directory
pub fn render_result(config: &OutputConfig, root: &Path, result: &DirectoryResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {}",
        marker(config, result.classification),
        style(display_path(root, &result.directory)).bold()
    );
    for line in &result.output {
        let _ = writeln!(out, "    {}", line);
    }
    out
}

/// End-of-run summary listing failing and IAM-relevant directories separately
pub fn render_summary(config: &OutputConfig, root: &Path, summary: &ExecutionSummary) -> String {
    let mut out = String::new();
    let count = |classification| summary.with_classification(classification).len();

    let _ = writeln!(
        out,
        "{} {}: {} ok, {} with changes, {} with IAM changes, {} failed",
        emoji(config, "📊", "[SUMMARY]"),
        summary.command,
        count(Classification::Success),
        count(Classification::DiffPresent),
        count(Classification::IamChange),
        count(Classification::ToolFailure),
    );

    let sections: [(&str, Vec<&Path>); 4] = [
        (
            "Failed",
            summary.failures().iter().map(|r| r.directory.as_path()).collect(),
        ),
        (
            "IAM changes",
            summary.iam_changes().iter().map(|r| r.directory.as_path()).collect(),
        ),
        (
            "Skipped after failure",
            summary.skipped.iter().map(|p| p.as_path()).collect(),
        ),
        (
            "Not selected",
            summary.not_selected.iter().map(|p| p.as_path()).collect(),
        ),
    ];

    for (title, dirs) in sections {
        if dirs.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{}:", style(title).bold());
        for dir in dirs {
            let _ = writeln!(out, "  - {}", display_path(root, dir));
        }
    }
    out
}
