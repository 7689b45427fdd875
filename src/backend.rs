//! State backend detection and `init` arguments.
//!
//! A directory declares its backend kind in a `terraform { backend "s3" {} }`
//! block. The bucket, region and lock table come from the wrapper
//! configuration, falling back to the `region`, `terraform_state_bucket` and
//! `terraform_lock_table` variables of the inherited `*.auto.tfvars` files.
//! The state key is derived from the directory's position in the repository
//! so that every directory gets its own state file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{self, S3Backend, WrapperConfig};
use crate::error::{Error, Result};

/// Lock table used when only inherited variables describe the S3 backend
pub const DEFAULT_LOCK_TABLE: &str = "terraform-locking";

/// Suffix of variable files inherited by every directory below them
pub const INHERITED_VARS_SUFFIX: &str = ".auto.tfvars";

/// Backend kinds the wrapper knows how to configure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    S3,
    Gcs,
    Other,
}

fn backend_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?m)^\s*backend\s+"([A-Za-z0-9_-]+)""#).expect("valid regex"))
}

fn tfvars_assignment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*([A-Za-z_][A-Za-z0-9_-]*)\s*=\s*"([^"]*)"\s*$"#).expect("valid regex")
    })
}

/// String variables assigned in the `*.auto.tfvars` files from `root` down to
/// `dir`. Deeper files override shallower ones; anything other than a plain
/// `name = "value"` line is ignored.
pub fn inherited_variables(root: &Path, dir: &Path) -> Result<BTreeMap<String, String>> {
    let files = config::find_ancestor_files(root, dir, |name| name.ends_with(INHERITED_VARS_SUFFIX))?;
    let mut variables = BTreeMap::new();
    for file in files {
        let content = fs::read_to_string(&file)?;
        for line in content.lines() {
            if let Some(captures) = tfvars_assignment_regex().captures(line) {
                variables.insert(captures[1].to_string(), captures[2].to_string());
            }
        }
    }
    Ok(variables)
}

/// S3 settings from the wrapper configuration, completed from inherited
/// variables. Without a wrapper entry both `region` and
/// `terraform_state_bucket` must be set.
fn effective_s3(configured: Option<S3Backend>, variables: &BTreeMap<String, String>) -> Option<S3Backend> {
    let lock_table = variables.get("terraform_lock_table").cloned();
    match configured {
        Some(s3) => Some(S3Backend {
            dynamodb_table: s3.dynamodb_table.or(lock_table),
            ..s3
        }),
        None => Some(S3Backend {
            region: variables.get("region")?.clone(),
            bucket: variables.get("terraform_state_bucket")?.clone(),
            role_arn: None,
            dynamodb_table: Some(lock_table.unwrap_or_else(|| DEFAULT_LOCK_TABLE.to_string())),
        }),
    }
}

/// Find the backend declared by the `*.tf` files directly inside `dir`.
pub fn detect_backend(dir: &Path) -> Result<Option<BackendKind>> {
    let mut files: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "tf"))
        .collect();
    files.sort();

    for file in files {
        let content = match fs::read_to_string(&file) {
            Ok(content) => content,
            Err(_) => continue,
        };
        if let Some(captures) = backend_regex().captures(&content) {
            let kind = match &captures[1] {
                "s3" => BackendKind::S3,
                "gcs" => BackendKind::Gcs,
                _ => BackendKind::Other,
            };
            return Ok(Some(kind));
        }
    }
    Ok(None)
}

/// Location of a directory's remote state, used by the repair logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLocation {
    pub bucket: String,
    pub key: String,
    pub lock_table: Option<String>,
}

/// Repository-relative identifier of `dir`: `<repo-name>/<relative path>`.
pub fn state_path(root: &Path, repo_name: &str, dir: &Path) -> String {
    let relative = dir
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| dir.to_string_lossy().trim_start_matches('/').to_string());
    if relative.is_empty() {
        repo_name.to_string()
    } else {
        format!("{}/{}", repo_name, relative)
    }
}

/// Backend arguments for `init` plus the state location, if the directory
/// uses an S3 backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSettings {
    pub init_args: Vec<String>,
    pub state: Option<StateLocation>,
}

/// Compute the `-backend-config` arguments for `dir`.
///
/// With `configure_backend: false` no arguments are produced. With
/// `backend_check: true` a directory that declares no backend is a
/// configuration error.
pub fn backend_settings(
    root: &Path,
    repo_name: &str,
    dir: &Path,
    config: &WrapperConfig,
) -> Result<BackendSettings> {
    let kind = detect_backend(dir)?;

    if config.backend_check && kind.is_none() {
        return Err(Error::Config {
            path: dir.to_path_buf(),
            message: "no backend block declared (set backend_check: false to allow)".to_string(),
        });
    }

    let path = state_path(root, repo_name, dir);
    let mut options: Vec<(String, String)> = Vec::new();
    let mut state = None;

    let backends = config.backends.clone().unwrap_or_default();
    let s3 = match kind {
        Some(BackendKind::S3) => effective_s3(backends.s3, &inherited_variables(root, dir)?),
        _ => backends.s3,
    };
    match (kind, s3, backends.gcs) {
        (Some(BackendKind::S3), Some(s3), _) => {
            let key = format!("{}.tfstate", path);
            options.push(("bucket".to_string(), s3.bucket.clone()));
            options.push(("region".to_string(), s3.region.clone()));
            options.push(("key".to_string(), key.clone()));
            options.push(("encrypt".to_string(), "true".to_string()));
            if let Some(table) = &s3.dynamodb_table {
                options.push(("dynamodb_table".to_string(), table.clone()));
            }
            if let Some(role_arn) = &s3.role_arn {
                options.push(("role_arn".to_string(), role_arn.clone()));
            }
            state = Some(StateLocation {
                bucket: s3.bucket,
                key,
                lock_table: s3.dynamodb_table,
            });
        }
        (Some(BackendKind::Gcs), _, Some(gcs)) => {
            options.push(("bucket".to_string(), gcs.bucket));
            options.push(("prefix".to_string(), path));
        }
        _ => {}
    }

    if !config.configure_backend {
        return Ok(BackendSettings {
            init_args: Vec::new(),
            state,
        });
    }

    let mut init_args = vec!["-reconfigure".to_string()];
    init_args.extend(
        options
            .into_iter()
            .map(|(key, value)| format!("-backend-config={}={}", key, value)),
    );
    Ok(BackendSettings { init_args, state })
}
