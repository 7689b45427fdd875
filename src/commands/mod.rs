//! # CLI Command Implementations
//!
//! Each subcommand of `tfstage` lives in its own file and contains:
//! - An `Args` struct that defines the command-specific arguments and options,
//!   derived using `clap`.
//! - An `execute` function that takes the parsed `Args`, calls into the
//!   `tfstage` library and returns the process exit code.

pub mod completions;
pub mod graph;
pub mod plugins;
pub mod run;
pub mod validate;
