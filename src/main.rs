//! # tfstage CLI
//!
//! Binary entry point for the `tfstage` command-line tool. It parses the
//! arguments, dispatches to the command and turns the outcome into the
//! process exit code:
//!
//! - `0`: every directory succeeded (with or without pending changes)
//! - `1`: configuration error, dependency cycle or other general failure
//! - `2`: IAM-relevant changes were detected
//! - `3`: the tool failed in at least one directory
//!
//! The logic lives in the `tfstage` library crate; the binary is a thin
//! wrapper around it.

mod cli;
mod commands;

use clap::Parser;

fn main() {
    // Usage errors exit 1; exit 2 is reserved for IAM changes
    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };
    let code = match cli.execute() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
