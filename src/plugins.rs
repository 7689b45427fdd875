//! Download of third-party tool plugins listed under `plugins`.
//!
//! Each plugin is first requested from `<url>/<OS>/<arch>`; if that fails the
//! plain `<url>` is used. The ETag of the last download is kept beside the
//! file in `<name>.etag` and sent as `If-None-Match`, so unchanged plugins
//! are not downloaded again.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use url::Url;

use crate::error::{Error, Result};

/// Response of a conditional download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    NotModified,
    Content { bytes: Vec<u8>, etag: Option<String> },
}

/// Trait for downloads - allows substituting canned responses in tests
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, sending `etag` as `If-None-Match` when given.
    fn fetch(&self, url: &str, etag: Option<&str>) -> Result<Fetched>;
}

/// HTTP(S) fetcher backed by `ureq`
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

const NOT_MODIFIED: u16 = 304;

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, etag: Option<&str>) -> Result<Fetched> {
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Download {
                url: url.to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let mut request = self
            .agent
            .get(url)
            .header("User-Agent", concat!("tfstage/", env!("CARGO_PKG_VERSION")));
        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }

        let mut response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(NOT_MODIFIED)) => return Ok(Fetched::NotModified),
            Err(e) => {
                return Err(Error::Download {
                    url: url.to_string(),
                    message: e.to_string(),
                })
            }
        };
        if response.status().as_u16() == NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }

        let etag = response
            .headers()
            .get("etag")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .body_mut()
            .read_to_vec()
            .map_err(|e| Error::Download {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Fetched::Content { bytes, etag })
    }
}

/// Platform segment appended to plugin URLs, e.g. `Linux/x86_64`
pub fn platform_suffix() -> String {
    let os = match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    };
    let arch = match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => "arm64",
        (_, arch) => arch,
    };
    format!("{}/{}", os, arch)
}

/// `file` with `suffix` appended to its full name
fn with_suffix(file: &Path, suffix: &str) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn etag_path(file: &Path) -> PathBuf {
    with_suffix(file, ".etag")
}

fn partial_path(file: &Path) -> PathBuf {
    with_suffix(file, ".partial")
}

/// Whether a download happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloaded,
    Unchanged,
}

/// Download `url` to `file` unless the stored ETag says it is current.
pub fn download_file(fetcher: &dyn Fetcher, url: &str, file: &Path) -> Result<DownloadStatus> {
    let etag_file = etag_path(file);
    let etag = if file.is_file() {
        fs::read_to_string(&etag_file).ok()
    } else {
        None
    };

    info!("Downloading {}", url);
    let (bytes, etag) = match fetcher.fetch(url, etag.as_deref())? {
        Fetched::NotModified => return Ok(DownloadStatus::Unchanged),
        Fetched::Content { bytes, etag } => (bytes, etag),
    };

    let partial = partial_path(file);
    fs::write(&partial, bytes)?;
    make_executable(&partial)?;
    fs::rename(&partial, file)?;

    if let Some(etag) = etag {
        // S3 quotes its ETags
        fs::write(&etag_file, etag.trim_matches('"'))?;
    }
    Ok(DownloadStatus::Downloaded)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Download every plugin into `plugin_dir`, preferring the platform URL.
pub fn download_plugins(
    fetcher: &dyn Fetcher,
    plugins: &BTreeMap<String, String>,
    plugin_dir: &Path,
) -> Result<BTreeMap<String, DownloadStatus>> {
    fs::create_dir_all(plugin_dir)?;
    let suffix = platform_suffix();
    let mut statuses = BTreeMap::new();

    for (name, url) in plugins {
        let file = plugin_dir.join(name);
        let base = url.trim_end_matches('/');
        let platform_url = format!("{}/{}", base, suffix);

        let status = match download_file(fetcher, &platform_url, &file) {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    "Unable to get plugin from {} ({}), trying {}",
                    platform_url, e, url
                );
                download_file(fetcher, url, &file)?
            }
        };
        statuses.insert(name.clone(), status);
    }
    Ok(statuses)
}
