//! # Wrapper Configuration
//!
//! This module defines the `.tf_wrapper` configuration schema and the logic
//! that turns a chain of hierarchical configuration files into one effective
//! [`WrapperConfig`] for a directory.
//!
//! ## Hierarchy
//!
//! Every directory between the repository root and a terraform directory may
//! carry its own wrapper file. [`find_config_chain`] collects them root-most
//! first and [`resolve`] folds them left to right, so settings closer to the
//! directory win.
//!
//! ## Merge rules
//!
//! Fields do not all merge the same way. The rule for each top-level field is
//! listed in [`MERGE_STRATEGIES`]:
//!
//! - **Override**: the child's value replaces the parent's (`configure_backend`,
//!   `backend_check`, `plan_check`, `audit_api_url`).
//! - **KeyMerge**: mappings are merged key by key, the child's entry replaces
//!   the parent's entry on collision and other parent keys survive
//!   (`envvars`, `plugins`).
//! - **DeepMerge**: nested mappings are merged recursively (`backends`).
//!
//! Unknown fields, unknown `source` values and missing `path`/`value` fields
//! are reported as [`Error::Config`].

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// File names recognised as wrapper configuration. When a directory has more
/// than one they are applied in lexical order, which is the order listed here.
pub const CONFIG_FILE_NAMES: &[&str] = &[".tf_wrapper", ".tf_wrapper.yaml", ".tf_wrapper.yml"];

/// Where the value of an environment variable comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvVarSource {
    /// Read from the remote parameter store at `path`
    Ssm,
    /// Literal `value`
    Text,
}

/// One entry of the `envvars` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvVarSpec {
    pub source: EnvVarSource,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl EnvVarSpec {
    pub fn text(value: &str) -> Self {
        Self {
            source: EnvVarSource::Text,
            path: None,
            value: Some(value.to_string()),
        }
    }

    pub fn ssm(path: &str) -> Self {
        Self {
            source: EnvVarSource::Ssm,
            path: Some(path.to_string()),
            value: None,
        }
    }

    fn validate(&self, name: &str) -> std::result::Result<(), String> {
        match self.source {
            EnvVarSource::Ssm if self.path.is_none() => {
                Err(format!("envvar '{}' uses source 'ssm' but has no 'path'", name))
            }
            EnvVarSource::Text if self.value.is_none() => {
                Err(format!("envvar '{}' uses source 'text' but has no 'value'", name))
            }
            _ => Ok(()),
        }
    }
}

/// S3 state backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Backend {
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub dynamodb_table: Option<String>,
}

/// GCS state backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcsBackend {
    pub bucket: String,
}

/// The `backends` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSpec {
    #[serde(default)]
    pub s3: Option<S3Backend>,
    #[serde(default)]
    pub gcs: Option<GcsBackend>,
}

fn default_true() -> bool {
    true
}

/// Effective wrapper settings for one directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WrapperConfig {
    /// Pass backend settings to `init`
    #[serde(default = "default_true")]
    pub configure_backend: bool,
    /// Require the directory to declare a backend block
    #[serde(default = "default_true")]
    pub backend_check: bool,
    /// Include the directory in graph runs
    #[serde(default = "default_true")]
    pub plan_check: bool,
    #[serde(default)]
    pub envvars: BTreeMap<String, EnvVarSpec>,
    /// Plugin name to download URL
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,
    #[serde(default)]
    pub backends: Option<BackendSpec>,
    #[serde(default)]
    pub audit_api_url: Option<String>,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            configure_backend: true,
            backend_check: true,
            plan_check: true,
            envvars: BTreeMap::new(),
            plugins: BTreeMap::new(),
            backends: None,
            audit_api_url: None,
        }
    }
}

/// How a top-level field combines with the value inherited from ancestors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Override,
    KeyMerge,
    DeepMerge,
}

/// Merge rule for every field of [`WrapperConfig`].
pub const MERGE_STRATEGIES: &[(&str, MergeStrategy)] = &[
    ("configure_backend", MergeStrategy::Override),
    ("backend_check", MergeStrategy::Override),
    ("plan_check", MergeStrategy::Override),
    ("audit_api_url", MergeStrategy::Override),
    ("envvars", MergeStrategy::KeyMerge),
    ("plugins", MergeStrategy::KeyMerge),
    ("backends", MergeStrategy::DeepMerge),
];

/// Look up the merge rule for a top-level field.
pub fn merge_strategy(field: &str) -> Option<MergeStrategy> {
    MERGE_STRATEGIES
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, strategy)| *strategy)
}

/// Returns whether `file_name` is a wrapper configuration file.
pub fn is_config_file_name(file_name: &str) -> bool {
    CONFIG_FILE_NAMES.contains(&file_name)
}

/// Directories from `root` down to `directory`, inclusive.
///
/// If `directory` is not below `root`, the walk starts at the filesystem root.
pub fn ancestor_dirs(root: &Path, directory: &Path) -> Vec<PathBuf> {
    let (start, rest) = match directory.strip_prefix(root) {
        Ok(relative) => (root.to_path_buf(), relative.to_path_buf()),
        Err(_) => (PathBuf::new(), directory.to_path_buf()),
    };

    let mut dirs = Vec::new();
    let mut current = start;
    if !current.as_os_str().is_empty() {
        dirs.push(current.clone());
    }
    for component in rest.components() {
        match component {
            Component::CurDir => continue,
            other => current.push(other.as_os_str()),
        }
        dirs.push(current.clone());
    }
    dirs
}

/// Collect the files accepted by `matches` in every directory from `root` down
/// to `directory`, root-most first and sorted by name within a directory.
///
/// Directories that cannot be listed (for example because they were removed)
/// are skipped.
pub fn find_ancestor_files<F>(root: &Path, directory: &Path, matches: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&str) -> bool,
{
    let mut found = Vec::new();
    for dir in ancestor_dirs(root, directory) {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| matches(name))
            .collect();
        names.sort();

        found.extend(names.into_iter().map(|name| dir.join(name)));
    }
    Ok(found)
}

/// Find every wrapper configuration file that applies to `directory`.
pub fn find_config_chain(root: &Path, directory: &Path) -> Result<Vec<PathBuf>> {
    find_ancestor_files(root, directory, is_config_file_name)
}

/// Merge and validate the configuration files of a chain.
pub fn resolve(chain: &[PathBuf]) -> Result<WrapperConfig> {
    let mut documents = Vec::with_capacity(chain.len());
    for path in chain {
        let content = fs::read_to_string(path)?;
        documents.push((path.clone(), content));
    }
    resolve_documents(&documents)
}

/// Resolve the effective configuration of `directory`.
pub fn resolve_for_directory(root: &Path, directory: &Path) -> Result<WrapperConfig> {
    let chain = find_config_chain(root, directory)?;
    resolve(&chain)
}

/// Merge already-loaded documents, root-most first.
///
/// Each entry carries the path it came from so errors can name the file.
pub fn resolve_documents(documents: &[(PathBuf, String)]) -> Result<WrapperConfig> {
    let mut merged = Mapping::new();
    let mut last_path = PathBuf::from("<defaults>");

    for (path, content) in documents {
        if let Some(layer) = parse_layer(path, content)? {
            merge_layer(&mut merged, layer, path)?;
        }
        last_path = path.clone();
    }

    let config: WrapperConfig =
        serde_yaml::from_value(Value::Mapping(merged)).map_err(|e| Error::Config {
            path: last_path.clone(),
            message: e.to_string(),
        })?;

    for (name, spec) in &config.envvars {
        spec.validate(name).map_err(|message| Error::Config {
            path: last_path.clone(),
            message,
        })?;
    }

    Ok(config)
}

/// Parse one wrapper file into a mapping. Empty documents yield `None`.
fn parse_layer(path: &Path, content: &str) -> Result<Option<Mapping>> {
    let value: Value = serde_yaml::from_str(content).map_err(|e| Error::Config {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    match value {
        Value::Null => Ok(None),
        Value::Mapping(mapping) => Ok(Some(mapping)),
        _ => Err(Error::Config {
            path: path.to_path_buf(),
            message: "top level of a wrapper file must be a mapping".to_string(),
        }),
    }
}

fn merge_layer(base: &mut Mapping, layer: Mapping, path: &Path) -> Result<()> {
    for (key, value) in layer {
        let field = key.as_str().ok_or_else(|| Error::Config {
            path: path.to_path_buf(),
            message: format!("field names must be strings, found {:?}", key),
        })?;
        let strategy = merge_strategy(field).ok_or_else(|| Error::Config {
            path: path.to_path_buf(),
            message: format!("unknown field '{}'", field),
        })?;

        match strategy {
            MergeStrategy::Override => {
                base.insert(key, value);
            }
            MergeStrategy::KeyMerge => {
                let incoming = match value {
                    Value::Null => continue,
                    Value::Mapping(mapping) => mapping,
                    _ => {
                        return Err(Error::Config {
                            path: path.to_path_buf(),
                            message: format!("field '{}' must be a mapping", field),
                        })
                    }
                };
                let slot = base
                    .entry(key)
                    .or_insert_with(|| Value::Mapping(Mapping::new()));
                if let Value::Mapping(existing) = slot {
                    for (entry_key, entry_value) in incoming {
                        existing.insert(entry_key, entry_value);
                    }
                } else {
                    *slot = Value::Mapping(incoming);
                }
            }
            MergeStrategy::DeepMerge => match base.get_mut(&key) {
                Some(existing) => deep_merge(existing, value),
                None => {
                    base.insert(key, value);
                }
            },
        }
    }
    Ok(())
}

fn deep_merge(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Mapping(existing), Value::Mapping(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}
