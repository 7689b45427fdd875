use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::Error;

fn git(dir: &Path, args: &[&str]) -> Result<String, Error> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .map_err(|e| Error::Git {
            command: format!("git {}", args.join(" ")),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(Error::Git {
            command: format!("git {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Top-level directory of the work tree containing `dir`
pub fn toplevel(dir: &Path) -> Result<PathBuf, Error> {
    let out = git(dir, &["rev-parse", "--show-toplevel"])?;
    let top = PathBuf::from(out.trim());
    // Match the canonical paths discovery works with
    Ok(std::fs::canonicalize(&top).unwrap_or(top))
}

/// Repository name from the `origin` remote URL, e.g. `infra` for
/// `git@github.com:org/infra.git`.
pub fn origin_repo_name(dir: &Path) -> Result<String, Error> {
    let url = git(dir, &["remote", "get-url", "origin"])?;
    repo_name_from_url(url.trim()).ok_or_else(|| Error::Git {
        command: "git remote get-url origin".to_string(),
        stderr: format!("cannot determine repository name from '{}'", url.trim()),
    })
}

fn repo_name_from_url(url: &str) -> Option<String> {
    let last = url.trim_end_matches('/').rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Absolute paths of files that differ between `base` and the work tree.
///
/// Uses `git diff --name-only <base>`, so uncommitted changes count too.
pub fn changed_files(dir: &Path, base: &str) -> Result<BTreeSet<PathBuf>, Error> {
    let top = toplevel(dir)?;
    let out = git(dir, &["diff", "--name-only", base])?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| top.join(line))
        .collect())
}
