// src/source/http.rs

//! Network and local-path source backends
//!
//! - GitHub: the releases API (`/repos/{owner}/{repo}/releases`)
//! - SpaceDock: the mod API (`/api/mod/{id}`)
//! - Url: a direct `http(s)://` download or a `file://` archive or directory

use super::archive;
use super::{Release, SourceFetch};
use crate::config::Config;
use crate::definition::SourceSpec;
use crate::error::{Error, FetchError, Result};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum attempts for transport-level failures
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 500;

const USER_AGENT: &str = concat!("packman/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    zipball_url: Option<String>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct SpaceDockMod {
    #[serde(default)]
    versions: Vec<SpaceDockVersion>,
}

#[derive(Debug, Deserialize)]
struct SpaceDockVersion {
    friendly_version: String,
    download_path: String,
}

/// Fetches every source kind over HTTP or from the local filesystem
pub struct HttpSource {
    client: Client,
    github_api_url: String,
    spacedock_url: String,
    max_retries: u32,
}

impl HttpSource {
    pub fn new(github_api_url: &str, spacedock_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            github_api_url: github_api_url.trim_end_matches('/').to_string(),
            spacedock_url: spacedock_url.trim_end_matches('/').to_string(),
            max_retries: MAX_RETRIES,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.github_api_url,
            &config.spacedock_url,
            config.fetch_timeout(),
        )
    }

    /// GET with retries on transport errors; HTTP errors are classified, not retried
    fn get(&self, url: &str) -> std::result::Result<Response, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    return Err(classify_status(status, url));
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(FetchError::Network(format!(
                            "{} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("Request to {} failed (attempt {}): {}, retrying...", url, attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> std::result::Result<T, FetchError> {
        debug!("GET {}", url);
        self.get(url)?
            .json()
            .map_err(|e| FetchError::Network(format!("{}: invalid response: {}", url, e)))
    }

    fn github_release(
        &self,
        repo: &str,
        version: Option<&str>,
    ) -> std::result::Result<Release, FetchError> {
        let url = match version {
            Some(tag) => format!("{}/repos/{}/releases/tags/{}", self.github_api_url, repo, tag),
            None => format!("{}/repos/{}/releases/latest", self.github_api_url, repo),
        };
        let release: GitHubRelease = self.get_json(&url)?;

        let archives: Vec<&GitHubAsset> = release
            .assets
            .iter()
            .filter(|a| is_archive_name(&a.name))
            .collect();

        let (url, file_name) = match archives.as_slice() {
            [asset] => (asset.browser_download_url.clone(), asset.name.clone()),
            [] => {
                let zipball = release.zipball_url.ok_or_else(|| {
                    FetchError::NotFound(format!("{} {} has no downloads", repo, release.tag_name))
                })?;
                (zipball, format!("{}.zip", release.tag_name))
            }
            many => {
                return Err(FetchError::AmbiguousVersion(format!(
                    "{} {} has {} archive assets: {}",
                    repo,
                    release.tag_name,
                    many.len(),
                    many.iter().map(|a| a.name.as_str()).collect::<Vec<_>>().join(", ")
                )));
            }
        };

        Ok(Release {
            version: Some(release.tag_name),
            url,
            file_name,
        })
    }

    fn spacedock_release(
        &self,
        id: u64,
        version: Option<&str>,
    ) -> std::result::Result<Release, FetchError> {
        let info: SpaceDockMod = self.get_json(&format!("{}/api/mod/{}", self.spacedock_url, id))?;

        // SpaceDock lists newest first
        let chosen = match version {
            Some(wanted) => info.versions.iter().find(|v| v.friendly_version == wanted),
            None => info.versions.first(),
        }
        .ok_or_else(|| {
            FetchError::NotFound(format!(
                "spacedock mod {} has no version {}",
                id,
                version.unwrap_or("(any)")
            ))
        })?;

        Ok(Release {
            version: Some(chosen.friendly_version.clone()),
            url: format!("{}{}", self.spacedock_url, chosen.download_path),
            file_name: format!("{}-{}.zip", id, chosen.friendly_version),
        })
    }

    fn download_http(&self, release: &Release, dest: &Path) -> std::result::Result<(), FetchError> {
        info!("Downloading {}", release.url);
        let mut response = self.get(&release.url)?;

        let mut staged = tempfile::NamedTempFile::new()
            .map_err(|e| FetchError::Archive(format!("failed to stage download: {}", e)))?;
        io::copy(&mut response, staged.as_file_mut())
            .map_err(|e| FetchError::Network(format!("{}: {}", release.url, e)))?;

        archive::unpack(staged.path(), dest)
    }
}

impl SourceFetch for HttpSource {
    fn resolve(
        &self,
        source: &SourceSpec,
        version: Option<&str>,
    ) -> std::result::Result<Release, FetchError> {
        match source {
            SourceSpec::GitHub(repo) => self.github_release(repo, version),
            SourceSpec::SpaceDock(id) => self.spacedock_release(*id, version),
            SourceSpec::Url(url) => {
                if let Some(version) = version {
                    return Err(FetchError::AmbiguousVersion(format!(
                        "{} is unversioned, cannot provide {}",
                        url, version
                    )));
                }
                if file_url_path(url).is_none() && !is_http(url) {
                    return Err(FetchError::NotSupported(format!("unsupported URL scheme: {}", url)));
                }
                Ok(Release {
                    version: None,
                    url: url.clone(),
                    file_name: url.rsplit('/').next().unwrap_or_default().to_string(),
                })
            }
            SourceSpec::Abstract(_) => Err(FetchError::NotSupported(
                "wuppertal sources have no fetch behavior".to_string(),
            )),
        }
    }

    fn download(&self, release: &Release, dest: &Path) -> std::result::Result<(), FetchError> {
        match file_url_path(&release.url) {
            Some(path) => {
                if path.is_dir() {
                    archive::copy_tree(&path, dest)
                } else if path.is_file() {
                    archive::unpack(&path, dest)
                } else {
                    Err(FetchError::NotFound(format!("{} does not exist", path.display())))
                }
            }
            None => self.download_http(release, dest),
        }
    }

    fn versions(&self, source: &SourceSpec) -> std::result::Result<Vec<String>, FetchError> {
        match source {
            SourceSpec::GitHub(repo) => {
                let releases: Vec<GitHubRelease> =
                    self.get_json(&format!("{}/repos/{}/releases", self.github_api_url, repo))?;
                Ok(releases.into_iter().map(|r| r.tag_name).collect())
            }
            SourceSpec::SpaceDock(id) => {
                let info: SpaceDockMod =
                    self.get_json(&format!("{}/api/mod/{}", self.spacedock_url, id))?;
                Ok(info.versions.into_iter().map(|v| v.friendly_version).collect())
            }
            SourceSpec::Url(_) => Ok(Vec::new()),
            SourceSpec::Abstract(_) => Err(FetchError::NotSupported(
                "wuppertal sources have no versions".to_string(),
            )),
        }
    }

    /// Copy a `file://` archive as-is; anything else is downloaded first
    fn fetch_file(&self, url: &str, dest: &Path) -> std::result::Result<(), FetchError> {
        match file_url_path(url) {
            Some(path) => std::fs::copy(&path, dest)
                .map(|_| ())
                .map_err(|e| FetchError::NotFound(format!("{}: {}", path.display(), e))),
            None => {
                let mut response = self.get(url)?;
                let mut file = File::create(dest)
                    .map_err(|e| FetchError::Archive(format!("{}: {}", dest.display(), e)))?;
                io::copy(&mut response, &mut file)
                    .map_err(|e| FetchError::Network(format!("{}: {}", url, e)))?;
                Ok(())
            }
        }
    }
}

fn classify_status(status: StatusCode, url: &str) -> FetchError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            FetchError::NotFound(format!("HTTP {} from {}", status, url))
        }
        _ => FetchError::Network(format!("HTTP {} from {}", status, url)),
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Local path named by a `file://` URL
pub(crate) fn file_url_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file://")?;
    // file:///C:/x on Windows
    let rest = if cfg!(windows) {
        rest.strip_prefix('/').unwrap_or(rest)
    } else {
        rest
    };
    Some(PathBuf::from(rest))
}

fn is_archive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    [".zip", ".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar.zst", ".tzst", ".tar"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn backend() -> HttpSource {
        HttpSource::new("http://127.0.0.1:9", "http://127.0.0.1:9", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_file_url_directory() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("mod");
        fs::create_dir_all(src.join("GameData")).unwrap();
        fs::write(src.join("GameData/a.cfg"), b"a").unwrap();

        let source = SourceSpec::Url(format!("file://{}", src.display()));
        let http = backend();
        let release = http.resolve(&source, None).unwrap();
        assert_eq!(release.version, None);

        let dest = temp.path().join("snapshot");
        http.download(&release, &dest).unwrap();
        assert_eq!(fs::read(dest.join("GameData/a.cfg")).unwrap(), b"a");
    }

    #[test]
    fn test_missing_file_url_is_not_found() {
        let temp = TempDir::new().unwrap();
        let source = SourceSpec::Url(format!("file://{}/absent.zip", temp.path().display()));
        let http = backend();
        let release = http.resolve(&source, None).unwrap();
        assert!(matches!(
            http.download(&release, &temp.path().join("out")),
            Err(FetchError::NotFound(_))
        ));
    }

    #[test]
    fn test_url_with_version_is_ambiguous() {
        let source = SourceSpec::Url("https://example.com/mod.zip".to_string());
        assert!(matches!(
            backend().resolve(&source, Some("1.2.0")),
            Err(FetchError::AmbiguousVersion(_))
        ));
    }

    #[test]
    fn test_placeholder_source_not_supported() {
        assert!(matches!(
            backend().resolve(&SourceSpec::Abstract(true), None),
            Err(FetchError::NotSupported(_))
        ));
    }

    #[test]
    fn test_unsupported_scheme() {
        let source = SourceSpec::Url("ftp://example.com/mod.zip".to_string());
        assert!(matches!(
            backend().resolve(&source, None),
            Err(FetchError::NotSupported(_))
        ));
    }

    #[test]
    fn test_unreachable_host_is_network_error() {
        let source = SourceSpec::GitHub("owner/repo".to_string());
        assert!(matches!(
            backend().resolve(&source, None),
            Err(FetchError::Network(_))
        ));
    }

    #[test]
    fn test_archive_names() {
        assert!(is_archive_name("Mod-1.0.ZIP"));
        assert!(is_archive_name("mod.tar.zst"));
        assert!(!is_archive_name("checksums.txt"));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "u"),
            FetchError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "u"),
            FetchError::Network(_)
        ));
    }
}
