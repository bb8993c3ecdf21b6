// src/source/mod.rs

//! Turning declared sources into local snapshots
//!
//! A [`Fetcher`] walks a definition's sources in order. Each one is asked to
//! resolve a release and then to materialize it; the first success wins and
//! every failure along the way is kept for the aggregate error. Versioned
//! snapshots are cached under `<cache>/<package>/<version>/`.
//!
//! A slot holds immutable generations (`g-<uuid>/`) and a `current` pointer.
//! A refetch publishes a new generation and repoints the slot; an old one is
//! only deleted once no snapshot holds its shared `.pin` lock, so installs
//! into other roots never see their files vanish.

pub mod archive;
pub mod http;

pub use http::HttpSource;

use crate::cancel::CancelToken;
use crate::definition::{PackageDefinition, SourceSpec};
use crate::error::{Error, FetchError, Result, SourceFailure};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;
use tracing::{debug, info, warn};

/// Subdirectory of a cache slot holding the unpacked files
const SNAPSHOT_DIR: &str = "snapshot";

/// Metadata file of a cache generation
const SOURCE_FILE: &str = "source.json";

/// Lock file readers hold shared while a generation is in use
const PIN_FILE: &str = ".pin";

/// Pointer to the generation a slot currently serves
const CURRENT_FILE: &str = "current";

const GENERATION_PREFIX: &str = "g-";

/// A concrete downloadable artifact for one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// `None` for unversioned sources such as plain URLs
    pub version: Option<String>,
    pub url: String,
    pub file_name: String,
}

/// Backend capable of fetching each source kind
///
/// The network implementation is [`HttpSource`]; tests substitute their own.
pub trait SourceFetch: Send + Sync {
    /// Pin a source (and optional requested version) to one release
    fn resolve(
        &self,
        source: &SourceSpec,
        version: Option<&str>,
    ) -> std::result::Result<Release, FetchError>;

    /// Unpack a resolved release into `dest`
    fn download(&self, release: &Release, dest: &Path) -> std::result::Result<(), FetchError>;

    /// Every version the source offers, newest first where the source says so
    fn versions(&self, _source: &SourceSpec) -> std::result::Result<Vec<String>, FetchError> {
        Ok(Vec::new())
    }

    /// Download a single file verbatim (used for definition updates)
    fn fetch_file(&self, url: &str, _dest: &Path) -> std::result::Result<(), FetchError> {
        Err(FetchError::NotSupported(format!("cannot fetch {}", url)))
    }
}

/// A fetched, read-only package tree
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    version: Option<String>,
    source: SourceSpec,
    from_cache: bool,
    // Unversioned snapshots are not cached and vanish with the value
    _staging: Option<TempDir>,
    // Shared lock keeping a cached generation from being pruned
    _pin: Option<File>,
}

impl Snapshot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn source(&self) -> &SourceSpec {
        &self.source
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    source: SourceSpec,
    version: String,
}

/// Options for one fetch
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Ignore and replace cached snapshots
    pub no_cache: bool,
}

/// Source fallback chain plus snapshot cache
pub struct Fetcher {
    backend: Box<dyn SourceFetch>,
    cache_dir: PathBuf,
}

impl Fetcher {
    pub fn new(backend: Box<dyn SourceFetch>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn backend(&self) -> &dyn SourceFetch {
        self.backend.as_ref()
    }

    /// Fetch a snapshot for `package` from the first source that works
    pub fn fetch(
        &self,
        package: &str,
        definition: &PackageDefinition,
        version: Option<&str>,
        options: FetchOptions,
        cancel: &CancelToken,
    ) -> Result<Snapshot> {
        if let (Some(version), false) = (version, options.no_cache) {
            if let Some(snapshot) = self.cached(package, version) {
                info!("{} {} - using cached snapshot", package, version);
                return Ok(snapshot);
            }
        }

        let mut failures = Vec::new();
        for source in &definition.sources {
            cancel.check()?;
            debug!("{} - trying {}", package, source);

            match self.fetch_one(package, source, version, options) {
                Ok(snapshot) => {
                    info!(
                        "{} - fetched {} from {}",
                        package,
                        snapshot.version().unwrap_or("(unversioned)"),
                        source
                    );
                    return Ok(snapshot);
                }
                Err(error) => {
                    warn!("{} - {} failed: {}", package, source, error);
                    failures.push(SourceFailure {
                        source: source.label(),
                        error,
                    });
                }
            }
        }

        Err(Error::FetchFailed {
            package: package.to_string(),
            failures,
        })
    }

    /// Versions offered by every source, de-duplicated, in source order
    pub fn available_versions(&self, definition: &PackageDefinition) -> Vec<String> {
        let mut versions: Vec<String> = Vec::new();
        for source in &definition.sources {
            match self.backend.versions(source) {
                Ok(found) => {
                    for version in found {
                        if !versions.contains(&version) {
                            versions.push(version);
                        }
                    }
                }
                Err(e) => warn!("{}: cannot list versions: {}", source, e),
            }
        }
        versions
    }

    fn fetch_one(
        &self,
        package: &str,
        source: &SourceSpec,
        version: Option<&str>,
        options: FetchOptions,
    ) -> std::result::Result<Snapshot, FetchError> {
        let release = self.backend.resolve(source, version)?;

        if let (Some(resolved), false) = (&release.version, options.no_cache) {
            if let Some(snapshot) = self.cached(package, resolved) {
                return Ok(snapshot);
            }
        }

        fs::create_dir_all(&self.cache_dir).map_err(|e| staging_err(&self.cache_dir, e))?;
        let staging = tempfile::Builder::new()
            .prefix(".fetch-")
            .tempdir_in(&self.cache_dir)
            .map_err(|e| staging_err(&self.cache_dir, e))?;
        let unpacked = staging.path().join(SNAPSHOT_DIR);
        fs::create_dir_all(&unpacked).map_err(|e| staging_err(&unpacked, e))?;

        self.backend.download(&release, &unpacked)?;

        match release.version {
            Some(resolved) => {
                let record = CacheRecord {
                    source: source.clone(),
                    version: resolved.clone(),
                };
                let record = serde_json::to_vec_pretty(&record)
                    .map_err(|e| FetchError::Archive(e.to_string()))?;
                fs::write(staging.path().join(SOURCE_FILE), record)
                    .map_err(|e| staging_err(staging.path(), e))?;

                // Pinned before it is visible so a concurrent prune skips it
                let pin = pin_generation(staging.path())?;

                let slot = self.slot(package, &resolved);
                fs::create_dir_all(&slot).map_err(|e| staging_err(&slot, e))?;
                let generation = format!("{}{}", GENERATION_PREFIX, Uuid::new_v4());
                let published = slot.join(&generation);
                let staged = staging.into_path();
                fs::rename(&staged, &published).map_err(|e| staging_err(&published, e))?;
                point_current(&slot, &generation)?;
                prune_generations(&slot, &generation);

                Ok(Snapshot {
                    path: published.join(SNAPSHOT_DIR),
                    version: Some(resolved),
                    source: source.clone(),
                    from_cache: false,
                    _staging: None,
                    _pin: Some(pin),
                })
            }
            None => Ok(Snapshot {
                path: unpacked,
                version: None,
                source: source.clone(),
                from_cache: false,
                _staging: Some(staging),
                _pin: None,
            }),
        }
    }

    /// The current generation of a cache slot, or `None` (a damaged slot is just a miss)
    fn cached(&self, package: &str, version: &str) -> Option<Snapshot> {
        let slot = self.slot(package, version);
        let current = fs::read_to_string(slot.join(CURRENT_FILE)).ok()?;
        let generation = current.trim();
        if !generation.starts_with(GENERATION_PREFIX) || generation != sanitize(generation) {
            warn!("Ignoring damaged cache pointer in {}", slot.display());
            return None;
        }

        let dir = slot.join(generation);
        // A generation pruned between reading the pointer and pinning is a miss
        let pin = pin_generation(&dir).ok()?;
        let raw = fs::read(dir.join(SOURCE_FILE)).ok()?;
        let record: CacheRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring damaged cache entry {}: {}", dir.display(), e);
                return None;
            }
        };
        let path = dir.join(SNAPSHOT_DIR);
        if !path.is_dir() {
            return None;
        }

        Some(Snapshot {
            path,
            version: Some(record.version),
            source: record.source,
            from_cache: true,
            _staging: None,
            _pin: Some(pin),
        })
    }

    fn slot(&self, package: &str, version: &str) -> PathBuf {
        self.cache_dir
            .join(sanitize(package))
            .join(sanitize(version))
    }
}

/// Make a name safe to use as a single path component
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

/// Hold a shared lock on a generation for as long as a snapshot uses it
fn pin_generation(dir: &Path) -> std::result::Result<File, FetchError> {
    let path = dir.join(PIN_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| staging_err(&path, e))?;
    file.lock_shared().map_err(|e| staging_err(&path, e))?;
    Ok(file)
}

/// Atomically switch a slot to `generation`
fn point_current(slot: &Path, generation: &str) -> std::result::Result<(), FetchError> {
    let staged = slot.join(format!(".{}.tmp", generation));
    fs::write(&staged, generation).map_err(|e| staging_err(&staged, e))?;
    let current = slot.join(CURRENT_FILE);
    fs::rename(&staged, &current).map_err(|e| staging_err(&current, e))
}

/// Delete every other generation no snapshot is still reading
fn prune_generations(slot: &Path, keep: &str) {
    let Ok(entries) = fs::read_dir(slot) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(GENERATION_PREFIX) || name == keep {
            continue;
        }

        let dir = entry.path();
        let Ok(pin) = OpenOptions::new().read(true).write(true).open(dir.join(PIN_FILE)) else {
            continue;
        };
        match pin.try_lock() {
            Ok(()) => {
                debug!("Pruning cache generation {}", dir.display());
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!("Failed to prune {}: {}", dir.display(), e);
                }
            }
            Err(TryLockError::WouldBlock) => debug!("{} is still in use", dir.display()),
            Err(TryLockError::Error(e)) => warn!("Cannot lock {}: {}", dir.display(), e),
        }
    }
}

fn staging_err(path: &Path, e: std::io::Error) -> FetchError {
    FetchError::Archive(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{CopyFolder, InstallStep};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serves fixed trees keyed by source label
    struct FakeSource {
        root: PathBuf,
        downloads: Arc<AtomicUsize>,
    }

    impl SourceFetch for FakeSource {
        fn resolve(
            &self,
            source: &SourceSpec,
            version: Option<&str>,
        ) -> std::result::Result<Release, FetchError> {
            match source {
                SourceSpec::GitHub(repo) if repo == "down/down" => {
                    Err(FetchError::Network("connection refused".to_string()))
                }
                SourceSpec::GitHub(repo) => Ok(Release {
                    version: Some(version.unwrap_or("1.0.0").to_string()),
                    url: repo.clone(),
                    file_name: String::new(),
                }),
                SourceSpec::SpaceDock(_) => Err(FetchError::NotFound("no such mod".to_string())),
                _ => Err(FetchError::NotSupported(source.label())),
            }
        }

        fn download(&self, release: &Release, dest: &Path) -> std::result::Result<(), FetchError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            archive::copy_tree(&self.root.join(&release.url), dest)
        }

        fn versions(&self, source: &SourceSpec) -> std::result::Result<Vec<String>, FetchError> {
            match source {
                SourceSpec::GitHub(_) => Ok(vec!["1.1.0".to_string(), "1.0.0".to_string()]),
                SourceSpec::SpaceDock(_) => Ok(vec!["1.0.0".to_string(), "0.9".to_string()]),
                _ => Ok(Vec::new()),
            }
        }
    }

    fn definition(sources: Vec<SourceSpec>) -> PackageDefinition {
        PackageDefinition {
            name: "Example".to_string(),
            description: None,
            sources,
            steps: vec![InstallStep::CopyFolder(CopyFolder {
                pattern: "Mod".to_string(),
                to: "GameData".to_string(),
                exclude: Vec::new(),
                conditions: Vec::new(),
            })],
        }
    }

    fn fetcher() -> (TempDir, Fetcher, Arc<AtomicUsize>) {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("trees/good/repo/Mod");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("part.cfg"), b"part").unwrap();

        let downloads = Arc::new(AtomicUsize::new(0));
        let backend = FakeSource {
            root: temp.path().join("trees"),
            downloads: downloads.clone(),
        };
        let fetcher = Fetcher::new(Box::new(backend), temp.path().join("cache"));
        (temp, fetcher, downloads)
    }

    #[test]
    fn test_falls_back_to_next_source() {
        let (_temp, fetcher, _) = fetcher();
        let def = definition(vec![
            SourceSpec::GitHub("down/down".to_string()),
            SourceSpec::GitHub("good/repo".to_string()),
        ]);

        let snapshot = fetcher
            .fetch("example", &def, None, FetchOptions::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(snapshot.source(), &SourceSpec::GitHub("good/repo".to_string()));
        assert_eq!(snapshot.version(), Some("1.0.0"));
        assert!(snapshot.path().join("Mod/part.cfg").is_file());
    }

    #[test]
    fn test_all_sources_failing_aggregates() {
        let (_temp, fetcher, _) = fetcher();
        let def = definition(vec![
            SourceSpec::GitHub("down/down".to_string()),
            SourceSpec::SpaceDock(7),
            SourceSpec::Abstract(true),
        ]);

        match fetcher.fetch("example", &def, None, FetchOptions::default(), &CancelToken::new()) {
            Err(Error::FetchFailed { package, failures }) => {
                assert_eq!(package, "example");
                assert_eq!(failures.len(), 3);
                assert!(matches!(failures[0].error, FetchError::Network(_)));
                assert!(matches!(failures[1].error, FetchError::NotFound(_)));
                assert!(matches!(failures[2].error, FetchError::NotSupported(_)));
            }
            other => panic!("expected FetchFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_cached_version_skips_download() {
        let (_temp, fetcher, downloads) = fetcher();
        let def = definition(vec![SourceSpec::GitHub("good/repo".to_string())]);
        let cancel = CancelToken::new();

        fetcher
            .fetch("example", &def, Some("2.0"), FetchOptions::default(), &cancel)
            .unwrap();
        let again = fetcher
            .fetch("example", &def, Some("2.0"), FetchOptions::default(), &cancel)
            .unwrap();
        assert!(again.from_cache());
        assert_eq!(downloads.load(Ordering::SeqCst), 1);

        let fresh = fetcher
            .fetch("example", &def, Some("2.0"), FetchOptions { no_cache: true }, &cancel)
            .unwrap();
        assert!(!fresh.from_cache());
        assert_eq!(downloads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refetch_keeps_snapshot_in_use() {
        let (_temp, fetcher, _) = fetcher();
        let def = definition(vec![SourceSpec::GitHub("good/repo".to_string())]);
        let cancel = CancelToken::new();
        let no_cache = FetchOptions { no_cache: true };

        let first = fetcher
            .fetch("example", &def, Some("2.0"), FetchOptions::default(), &cancel)
            .unwrap();
        let second = fetcher
            .fetch("example", &def, Some("2.0"), no_cache, &cancel)
            .unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().join("Mod/part.cfg").is_file());

        let first_path = first.path().to_path_buf();
        drop(first);
        drop(second);
        let third = fetcher
            .fetch("example", &def, Some("2.0"), no_cache, &cancel)
            .unwrap();
        assert!(!first_path.exists());

        let cached = fetcher
            .fetch("example", &def, Some("2.0"), FetchOptions::default(), &cancel)
            .unwrap();
        assert!(cached.from_cache());
        assert_eq!(cached.path(), third.path());
    }

    #[test]
    fn test_cancel_before_fetch() {
        let (_temp, fetcher, downloads) = fetcher();
        let def = definition(vec![SourceSpec::GitHub("good/repo".to_string())]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = fetcher.fetch("example", &def, None, FetchOptions::default(), &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(downloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_available_versions_dedupes_in_order() {
        let (_temp, fetcher, _) = fetcher();
        let def = definition(vec![
            SourceSpec::GitHub("good/repo".to_string()),
            SourceSpec::SpaceDock(7),
            SourceSpec::Url("https://example.com/x.zip".to_string()),
        ]);
        assert_eq!(fetcher.available_versions(&def), vec!["1.1.0", "1.0.0", "0.9"]);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("ksp/engineer"), "ksp_engineer");
        assert_eq!(sanitize("v1.2.3+build"), "v1.2.3+build");
        assert_eq!(sanitize(".."), "_..");
    }
}
