//! Default values for tfstage settings.
//!
//! Centralised here so the CLI flags, the runner and the tests agree.

use std::path::PathBuf;

/// Program invoked for every directory
pub const TOOL: &str = "terraform";

/// Maximum number of directories run at once within a level
pub const PARALLEL: usize = 4;

/// Age after which a held state lock is considered abandoned
pub const LOCK_TIMEOUT_MINUTES: i64 = 60;

/// Replacement output for directories without changes when only changes are shown
pub const NO_CHANGES_MESSAGE: &str = "No changes detected.";

/// Returns the directory plugins are downloaded into.
///
/// This is `~/.terraform.d/plugins`, where the tool looks for third-party
/// providers. Falls back to `.terraform.d/plugins` in the current directory
/// when the home directory cannot be determined.
pub fn default_plugin_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".terraform.d"))
        .unwrap_or_else(|| PathBuf::from(".terraform.d"))
        .join("plugins")
}
