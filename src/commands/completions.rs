//! # Completions Command Implementation
//!
//! Generates shell completion scripts with `clap_complete`.
//!
//! ```bash
//! tfstage completions bash > ~/.local/share/bash-completion/completions/tfstage
//! tfstage completions zsh > ~/.zfunc/_tfstage
//! ```

use anyhow::Result;
use clap::{Args, CommandFactory, ValueEnum};
use clap_complete::{generate, Shell};
use std::io;

use crate::cli::Cli;

/// Shell types for completion generation
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
    Elvish,
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

/// Generate shell completion scripts
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// The shell to generate completions for
    #[arg(value_enum)]
    pub shell: CompletionShell,
}

/// Execute the `completions` command, writing the script to stdout.
pub fn execute(args: CompletionsArgs) -> Result<i32> {
    let mut cmd = Cli::command();
    generate(Shell::from(args.shell), &mut cmd, "tfstage", &mut io::stdout());
    Ok(0)
}
