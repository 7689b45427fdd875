//! Secret resolution for `envvars` entries.
//!
//! Secrets are read through the [`SecretStore`] trait so the remote parameter
//! store can be replaced in tests. A [`SecretCache`] is created once per batch
//! and passed to every [`resolve_envvars`] call of that batch, so a path shared
//! by many directories is fetched only once.

use std::collections::{BTreeMap, HashMap};
use std::process::Command;
use std::sync::RwLock;

use log::debug;

use crate::config::{EnvVarSource, EnvVarSpec};
use crate::error::{Error, Result};

/// Read access to a remote secret store
pub trait SecretStore: Send + Sync {
    /// Fetch the value stored at `path`.
    ///
    /// Returns [`Error::SecretNotFound`] when the path does not exist.
    fn get(&self, path: &str) -> Result<String>;
}

/// Secret store backed by `aws ssm get-parameter`.
pub struct AwsSsmStore {
    region: Option<String>,
}

impl AwsSsmStore {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }
}

impl SecretStore for AwsSsmStore {
    fn get(&self, path: &str) -> Result<String> {
        let mut command = Command::new("aws");
        command.args([
            "ssm",
            "get-parameter",
            "--name",
            path,
            "--with-decryption",
            "--query",
            "Parameter.Value",
            "--output",
            "text",
        ]);
        if let Some(region) = &self.region {
            command.args(["--region", region]);
        }

        let output = command.output().map_err(|e| Error::SecretStore {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("ParameterNotFound") {
                return Err(Error::SecretNotFound {
                    path: path.to_string(),
                });
            }
            return Err(Error::SecretStore {
                path: path.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }
}

/// Per-batch cache of resolved secret values
#[derive(Debug, Default)]
pub struct SecretCache {
    values: RwLock<HashMap<String, String>>,
}

impl SecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `path`, fetching it from `store` on a miss.
    pub fn get_or_fetch(&self, path: &str, store: &dyn SecretStore) -> Result<String> {
        {
            let values = self.values.read().map_err(|_| Error::LockPoisoned {
                context: "secret cache".to_string(),
            })?;
            if let Some(value) = values.get(path) {
                return Ok(value.clone());
            }
        }

        debug!("Fetching secret {}", path);
        let value = store.get(path)?;

        let mut values = self.values.write().map_err(|_| Error::LockPoisoned {
            context: "secret cache".to_string(),
        })?;
        Ok(values.entry(path.to_string()).or_insert(value).clone())
    }

    pub fn len(&self) -> usize {
        self.values.read().map(|values| values.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turn the `envvars` section into concrete environment variables.
pub fn resolve_envvars(
    envvars: &BTreeMap<String, EnvVarSpec>,
    store: &dyn SecretStore,
    cache: &SecretCache,
) -> Result<BTreeMap<String, String>> {
    let mut resolved = BTreeMap::new();
    for (name, spec) in envvars {
        let value = match spec.source {
            EnvVarSource::Text => spec.value.clone().unwrap_or_default(),
            EnvVarSource::Ssm => {
                let path = spec.path.as_deref().ok_or_else(|| Error::SecretStore {
                    path: String::new(),
                    message: format!("envvar '{}' has no path", name),
                })?;
                cache.get_or_fetch(path, store)?
            }
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySecretStore;

    #[test]
    fn test_text_values_copied() {
        let store = MemorySecretStore::new(&[]);
        let cache = SecretCache::new();
        let mut envvars = BTreeMap::new();
        envvars.insert("REGION".to_string(), EnvVarSpec::text("us-west-2"));

        let resolved = resolve_envvars(&envvars, &store, &cache).unwrap();
        assert_eq!(resolved["REGION"], "us-west-2");
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn test_ssm_values_fetched_once_per_batch() {
        let store = MemorySecretStore::new(&[("/foo/bar", "value")]);
        let cache = SecretCache::new();
        let mut envvars = BTreeMap::new();
        envvars.insert("VAR1".to_string(), EnvVarSpec::ssm("/foo/bar"));
        envvars.insert("VAR2".to_string(), EnvVarSpec::ssm("/foo/bar"));

        let first = resolve_envvars(&envvars, &store, &cache).unwrap();
        let second = resolve_envvars(&envvars, &store, &cache).unwrap();

        assert_eq!(first["VAR1"], "value");
        assert_eq!(first["VAR2"], "value");
        assert_eq!(first, second);
        assert_eq!(store.calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_new_cache_fetches_again() {
        let store = MemorySecretStore::new(&[("/foo/bar", "value")]);
        let mut envvars = BTreeMap::new();
        envvars.insert("VAR1".to_string(), EnvVarSpec::ssm("/foo/bar"));

        resolve_envvars(&envvars, &store, &SecretCache::new()).unwrap();
        resolve_envvars(&envvars, &store, &SecretCache::new()).unwrap();
        assert_eq!(store.calls(), 2);
    }

    #[test]
    fn test_missing_secret_reported() {
        let store = MemorySecretStore::new(&[]);
        let cache = SecretCache::new();
        let mut envvars = BTreeMap::new();
        envvars.insert("VAR1".to_string(), EnvVarSpec::ssm("/missing"));

        let err = resolve_envvars(&envvars, &store, &cache).unwrap_err();
        assert!(matches!(err, Error::SecretNotFound { ref path } if path == "/missing"));
        assert!(cache.is_empty());
    }
}
