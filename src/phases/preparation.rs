//! Phase 3: Preparation
//!
//! Resolves everything a directory needs before the parallel phase starts:
//! environment variables (including secrets) and backend arguments. Secrets
//! go through one [`SecretCache`] for the whole batch, so a path shared by
//! many directories is fetched once. Any error here aborts the run before a
//! single directory is executed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::debug;

use super::discovery::Discovered;
use super::execution::UnitSettings;
use crate::backend;
use crate::error::{Error, Result};
use crate::secrets::{resolve_envvars, SecretCache, SecretStore};

/// Execute Phase 3: prepare `directories`.
pub fn execute<'a>(
    discovered: &Discovered,
    directories: impl IntoIterator<Item = &'a PathBuf>,
    repo_name: &str,
    store: &dyn SecretStore,
) -> Result<BTreeMap<PathBuf, UnitSettings>> {
    let cache = SecretCache::new();
    let mut settings = BTreeMap::new();

    for dir in directories {
        let config = discovered.configs.get(dir).ok_or_else(|| Error::Config {
            path: dir.clone(),
            message: "directory was not discovered".to_string(),
        })?;

        let env = resolve_envvars(&config.envvars, store, &cache)?;
        let backend = backend::backend_settings(&discovered.repo_root, repo_name, dir, config)?;
        debug!(
            "Prepared {} ({} env vars, {} init args)",
            dir.display(),
            env.len(),
            backend.init_args.len()
        );

        settings.insert(
            dir.clone(),
            UnitSettings {
                env,
                init_args: backend.init_args,
                state: backend.state,
            },
        );
    }

    debug!("Resolved {} distinct secrets", cache.len());
    Ok(settings)
}

/// Name used in state keys: the `origin` repository name, or the root
/// directory's name outside a git checkout.
pub fn default_repo_name(root: &Path) -> String {
    crate::git::origin_repo_name(root).unwrap_or_else(|_| {
        root.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string())
    })
}
