//! # Error Handling
//!
//! This module defines the centralized error type for `tfstage`. It uses the
//! `thiserror` library to build a single `Error` enum that covers every
//! failure mode of the library, with messages that name the offending file,
//! directory or command.
//!
//! ## Fatal vs. per-directory errors
//!
//! - **`Config`**, **`Pipeline`** and **`CycleDetected`** are fatal: they are
//!   raised while the run is being prepared, before any directory has been
//!   handed to the external tool.
//! - **`LockTable`**, **`Repair`**, **`SecretStore`** and **`Tool`** raised
//!   while a unit is executing are caught by the runner and recorded as a
//!   `ToolFailure` for that directory instead of aborting the batch.
//!
//! The `Result` type alias is used to return `Result<T, Error>` from library
//! functions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for tfstage operations
#[derive(Error, Debug)]
pub enum Error {
    /// A wrapper configuration file is malformed or contradictory.
    #[error("Configuration error in {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    /// The pipeline definition file could not be used.
    #[error("Pipeline definition error in {}: {message}", path.display())]
    Pipeline { path: PathBuf, message: String },

    /// The dependency graph contains a cycle.
    ///
    /// `nodes` lists the directories on the cycle in traversal order, with the
    /// first node repeated at the end.
    #[error("Cycle detected in directory dependencies: {}", format_cycle(nodes))]
    CycleDetected { nodes: Vec<PathBuf> },

    /// The external tool could not be launched.
    #[error("Failed to run {program} in {}: {message}", dir.display())]
    Tool {
        program: String,
        dir: PathBuf,
        message: String,
    },

    /// A secret path does not exist in the secret store.
    #[error("Secret not found: {path}")]
    SecretNotFound { path: String },

    /// The secret store failed for a reason other than a missing path.
    #[error("Secret store error for {path}: {message}")]
    SecretStore { path: String, message: String },

    /// A lock table call failed.
    #[error("Lock table error on {table}/{record}: {message}")]
    LockTable {
        table: String,
        record: String,
        message: String,
    },

    /// An automatic repair could not be carried out.
    #[error("Repair failed for {}: {message}", dir.display())]
    Repair { dir: PathBuf, message: String },

    /// A plugin download failed.
    #[error("Download failed for {url}: {message}")]
    Download { url: String, message: String },

    /// A git command failed.
    #[error("Git command failed: {command} - {stderr}")]
    Git { command: String, stderr: String },

    /// An error indicating that a mutex or other lock has been poisoned.
    #[error("Lock poisoned: {context}")]
    LockPoisoned { context: String },

    /// An I/O error, wrapped from `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML parsing error, wrapped from `serde_yaml::Error`.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON serialization error, wrapped from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A regular expression error, wrapped from `regex::Error`.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// A glob pattern error, wrapped from `glob::PatternError`.
    #[error("Glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    /// A URL parsing error, wrapped from `url::ParseError`.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The worker pool for a level could not be created.
    #[error("Failed to create worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    /// Whether this error must abort the run before any unit executes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config { .. } | Error::Pipeline { .. } | Error::CycleDetected { .. }
        )
    }
}

fn format_cycle(nodes: &[PathBuf]) -> String {
    nodes
        .iter()
        .map(|node| node.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
