//! Shared test utilities for CLI E2E tests.
//!
//! ## Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::prelude::*;
//!
//! #[test]
//! fn test_example() {
//!     let fixture = TestFixture::new().with_root_config(configs::NO_BACKEND);
//!     fixture.with_dir("network", "");
//!     fixture.command().args(["run", "plan"]).assert().success();
//! }
//! ```
//!
//! The fixture lays out a temporary directory as:
//!
//! - `repo/`: the scanned tree, the command's working directory
//! - `bin/terraform`: a fake tool script (unix only)
//! - `calls.log`: one line per fake tool invocation, `<dir> <args...>`
//!
//! The fake tool exits 0 for `init`. For any other command it prints the
//! content of `.fake_<command>` from the working directory, if present, and
//! exits with the code stored in `.fake_<command>_exit` (default 0).

use assert_fs::prelude::*;
use std::path::{Path, PathBuf};

/// Re-export commonly used test dependencies for convenience.
pub mod prelude {
    pub use assert_cmd::cargo::cargo_bin_cmd;
    pub use assert_fs::prelude::*;
    #[allow(unused_imports)]
    pub use assert_fs::TempDir;
    pub use predicates::prelude::*;

    #[allow(unused_imports)]
    pub use super::configs;
    #[allow(unused_imports)]
    pub use super::module;
    pub use super::TestFixture;
}

/// Common wrapper configuration snippets.
#[allow(dead_code)]
pub mod configs {
    /// Directories need not declare a backend.
    pub const NO_BACKEND: &str = "backend_check: false\n";

    /// Plain-text environment variable for every directory.
    pub const WITH_TEXT_ENV: &str = "\
backend_check: false
envvars:
  STAGE:
    source: text
    value: test
";

    /// Unknown field, rejected by strict parsing.
    pub const UNKNOWN_FIELD: &str = "backend_check: false\nretries: 3\n";

    /// Invalid YAML for error testing.
    pub const INVALID_YAML: &str = "backend_check: [unclosed";
}

/// A `module` block pointing at `source`.
#[allow(dead_code)]
pub fn module(source: &str) -> String {
    format!("module \"dep\" {{\n  source = \"{}\"\n}}\n", source)
}

#[cfg(unix)]
const FAKE_TOOL: &str = r#"#!/bin/sh
echo "$(pwd -P) $*" >> "__LOG__"
cmd="$1"
if [ "$cmd" = "init" ]; then
  exit 0
fi
if [ -f ".fake_$cmd" ]; then
  cat ".fake_$cmd"
fi
if [ -f ".fake_${cmd}_exit" ]; then
  exit "$(cat ".fake_${cmd}_exit")"
fi
exit 0
"#;

/// A temporary monorepo plus a fake tool recording its invocations.
pub struct TestFixture {
    temp_dir: assert_fs::TempDir,
}

impl TestFixture {
    /// Create a new fixture with an empty `repo/` directory.
    pub fn new() -> Self {
        let temp_dir = assert_fs::TempDir::new().expect("Failed to create temp directory");
        temp_dir
            .child("repo")
            .create_dir_all()
            .expect("Failed to create repo directory");
        let fixture = Self { temp_dir };
        #[cfg(unix)]
        fixture.install_fake_tool();
        fixture
    }

    #[cfg(unix)]
    fn install_fake_tool(&self) {
        use std::os::unix::fs::PermissionsExt;

        let log = self.temp_dir.path().join("calls.log");
        let script = FAKE_TOOL.replace("__LOG__", &log.display().to_string());
        let tool = self.temp_dir.child("bin/terraform");
        tool.write_str(&script).expect("Failed to write fake tool");
        std::fs::set_permissions(tool.path(), std::fs::Permissions::from_mode(0o755))
            .expect("Failed to make fake tool executable");
    }

    /// Add a `.tf_wrapper` at the repo root.
    pub fn with_root_config(self, content: &str) -> Self {
        self.with_file(".tf_wrapper", content)
    }

    /// Add a file below `repo/`.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.repo_child(path)
            .write_str(content)
            .expect("Failed to write file");
        self
    }

    /// Add a directory below `repo/` holding a `main.tf` with `content`.
    pub fn with_dir(self, dir: &str, content: &str) -> Self {
        self.with_file(&format!("{}/main.tf", dir), content)
    }

    /// Make the fake tool print `output` and exit with `code` for `command`
    /// in `dir`.
    #[allow(dead_code)]
    pub fn with_response(self, dir: &str, command: &str, code: i32, output: &str) -> Self {
        self.with_file(&format!("{}/.fake_{}", dir, command), output)
            .with_file(&format!("{}/.fake_{}_exit", dir, command), &code.to_string())
    }

    /// The scanned tree.
    pub fn repo(&self) -> PathBuf {
        self.temp_dir.path().join("repo")
    }

    fn repo_child(&self, path: &str) -> assert_fs::fixture::ChildPath {
        self.temp_dir.child(format!("repo/{}", path))
    }

    /// Path to the fake tool.
    #[allow(dead_code)]
    pub fn tool(&self) -> PathBuf {
        self.temp_dir.path().join("bin/terraform")
    }

    /// Invocations of the fake tool as `(directory relative to repo, args)`.
    #[allow(dead_code)]
    pub fn calls(&self) -> Vec<(String, String)> {
        let repo = std::fs::canonicalize(self.repo()).expect("repo exists");
        let log = std::fs::read_to_string(self.temp_dir.path().join("calls.log")).unwrap_or_default();
        log.lines()
            .filter_map(|line| {
                let (dir, args) = line.split_once(' ').unwrap_or((line, ""));
                let relative = Path::new(dir).strip_prefix(&repo).ok()?;
                Some((relative.display().to_string(), args.to_string()))
            })
            .collect()
    }

    /// Directories in the order the fake tool ran `command` in them.
    #[allow(dead_code)]
    pub fn order_of(&self, command: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(_, args)| args.split(' ').next() == Some(command))
            .map(|(dir, _)| dir)
            .collect()
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl TestFixture {
    /// Create a command running in `repo/` with the fake tool selected and
    /// colors and progress off.
    pub fn command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tfstage");
        cmd.current_dir(self.repo())
            .env("TFSTAGE_TOOL", self.temp_dir.path().join("bin/terraform"))
            .env_remove("TFSTAGE_PARALLEL")
            .env_remove("TFSTAGE_PIPELINE")
            .env_remove("TFSTAGE_LOCK_TIMEOUT")
            .env("NO_COLOR", "1")
            .arg("--color")
            .arg("never");
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_creates_repo() {
        let fixture = TestFixture::new();
        assert!(fixture.repo().is_dir());
    }

    #[test]
    fn test_fixture_with_dir() {
        let fixture = TestFixture::new().with_dir("network", "");
        assert!(fixture.repo().join("network/main.tf").exists());
    }

    #[test]
    fn test_configs_are_yaml() {
        for config in [configs::NO_BACKEND, configs::WITH_TEXT_ENV, configs::UNKNOWN_FIELD] {
            serde_yaml::from_str::<serde_yaml::Value>(config).expect("Config should be valid YAML");
        }
        assert!(serde_yaml::from_str::<serde_yaml::Value>(configs::INVALID_YAML).is_err());
    }
}
