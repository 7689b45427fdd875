//! Invocation of the external configuration tool.
//!
//! The tool is treated as an opaque subprocess: it receives an argument list,
//! a working directory and extra environment variables, and returns an exit
//! code together with everything it printed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::error::{Error, Result};

/// Exit code and captured output of one tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub lines: Vec<String>,
}

impl ToolOutput {
    pub fn new(exit_code: i32, lines: Vec<String>) -> Self {
        Self { exit_code, lines }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Trait for tool invocations - allows substituting a scripted tool in tests
pub trait ToolInvoker: Send + Sync {
    fn invoke(
        &self,
        args: &[String],
        working_dir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<ToolOutput>;
}

/// Runs the real tool binary as a child process.
pub struct SubprocessTool {
    program: PathBuf,
}

impl SubprocessTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ToolInvoker for SubprocessTool {
    fn invoke(
        &self,
        args: &[String],
        working_dir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<ToolOutput> {
        debug!(
            "Running {} {} in {}",
            self.program.display(),
            args.join(" "),
            working_dir.display()
        );

        let output = Command::new(&self.program)
            .args(args)
            .current_dir(working_dir)
            .envs(env)
            .output()
            .map_err(|e| Error::Tool {
                program: self.program.display().to_string(),
                dir: working_dir.to_path_buf(),
                message: e.to_string(),
            })?;

        // A signal-terminated child has no exit code
        let exit_code = output.status.code().unwrap_or(1);

        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string),
        );

        Ok(ToolOutput::new(exit_code, lines))
    }
}
