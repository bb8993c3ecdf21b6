// src/packman.rs

//! Install/uninstall orchestration
//!
//! Every mutating operation follows the same shape:
//!
//! 1. take the package lock for (root, package)
//! 2. recover stale transactions against the root
//! 3. (install) fetch a snapshot; failure here changes nothing
//! 4. open a journal transaction and perform every mutation through it
//! 5. enter Committing, write the manifest and history in one SQLite
//!    transaction, then mark the journal Committed
//!
//! Any error in 4 or 5 rolls the journal back before it is returned.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::db::models::{HistoryEntry, OperationKind, OriginalFile, OrphanedFile};
use crate::definition::{check_relative, DefinitionRepository, PackageDefinition};
use crate::error::{Error, Result};
use crate::hash::{fingerprint, fingerprint_all, fingerprint_if_exists};
use crate::journal::{Journal, RecoveryOutcome, Transaction};
use crate::manifest::{ManifestEntry, ManifestFile, ManifestStore, ManifestUpdate};
use crate::source::{archive, http::file_url_path, FetchOptions, Fetcher, HttpSource, Snapshot, SourceFetch};
use crate::step::{relative_slash, StepContext, StepOutcome};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory under the journal path holding preserved original files
const ORIGINALS_DIR: &str = "originals";

/// Flags for `install`
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Reinstall even when the same version is already installed
    pub force: bool,
    /// Ignore cached snapshots
    pub no_cache: bool,
}

/// What `uninstall` did with each tracked file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub package: String,
    /// Removed from the root
    pub deleted: Vec<String>,
    /// Modified since install; left in place
    pub orphaned: Vec<String>,
    /// Replaced by the file that existed before the install
    pub restored: Vec<String>,
    /// Already gone before the uninstall ran
    pub missing: Vec<String>,
}

/// Outcome of `import`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub installed: Vec<String>,
    /// Already installed at the requested version
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// The transactional package engine for one root
pub struct Packman {
    config: Config,
    root: PathBuf,
    definitions: DefinitionRepository,
    manifest: ManifestStore,
    journal: Journal,
    fetcher: Fetcher,
    cancel: CancelToken,
}

/// Manifest writes of an install, ready to commit
struct PlannedInstall {
    update: ManifestUpdate,
    entry: ManifestEntry,
    released: Vec<PathBuf>,
}

impl Packman {
    /// Engine fetching over the network
    pub fn new(config: Config) -> Result<Self> {
        let backend = HttpSource::from_config(&config)?;
        Self::with_backend(config, Box::new(backend))
    }

    /// Engine with a caller-provided fetch backend
    pub fn with_backend(config: Config, backend: Box<dyn SourceFetch>) -> Result<Self> {
        let root = config.root_path.canonicalize().map_err(|e| {
            Error::IoError(format!(
                "Install root {} is not accessible: {}",
                config.root_path.display(),
                e
            ))
        })?;
        if !root.is_dir() {
            return Err(Error::IoError(format!("{} is not a directory", root.display())));
        }

        let manifest = ManifestStore::open(&config.manifest_path)?;
        let journal = Journal::new(&config.journal_path);
        let fetcher = Fetcher::new(backend, &config.cache_path);
        let definitions = DefinitionRepository::new(&config.definition_path);

        debug!("Packman ready for {}", root.display());
        Ok(Self {
            config,
            root,
            definitions,
            manifest,
            journal,
            fetcher,
            cancel: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Canonical install root
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    /// Token checked by every operation of this engine
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn package_definition(&self, name: &str) -> Result<PackageDefinition> {
        self.definitions.load(name)
    }

    /// Every readable definition, keyed by name
    pub fn package_definitions(&self) -> Result<Vec<(String, PackageDefinition)>> {
        self.definitions.list()
    }

    pub fn list_installed(&self) -> Result<Vec<ManifestEntry>> {
        self.manifest.list()
    }

    pub fn orphans(&self) -> Result<Vec<OrphanedFile>> {
        self.manifest.orphans()
    }

    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.manifest.history()
    }

    /// Versions every source of a package offers
    pub fn available_versions(&self, name: &str) -> Result<Vec<String>> {
        let definition = self.definitions.load(name)?;
        Ok(self.fetcher.available_versions(&definition))
    }

    /// Install a package from its definition file
    pub fn install(
        &self,
        name: &str,
        version: Option<&str>,
        options: InstallOptions,
    ) -> Result<ManifestEntry> {
        let definition = self.definitions.load(name)?;
        self.install_definition(name, &definition, version, options)
    }

    /// Install from an already loaded definition, recorded under `name`
    pub fn install_definition(
        &self,
        name: &str,
        definition: &PackageDefinition,
        version: Option<&str>,
        options: InstallOptions,
    ) -> Result<ManifestEntry> {
        definition.validate()?;

        let _lock = self
            .journal
            .locks()
            .acquire(&self.root, name, self.config.lock_timeout())?;
        self.recover_stale(Some(name))?;

        let existing = self.manifest.get(name)?;
        if let (Some(installed), Some(wanted)) = (&existing, version) {
            if installed.resolved_version.as_deref() == Some(wanted) && !options.force {
                return Err(Error::AlreadyInstalled {
                    name: name.to_string(),
                    version: wanted.to_string(),
                });
            }
        }

        info!("{} - fetching", name);
        let snapshot = self.fetcher.fetch(
            name,
            definition,
            version,
            FetchOptions {
                no_cache: options.no_cache,
            },
            &self.cancel,
        )?;

        if let (Some(installed), Some(resolved)) = (&existing, snapshot.version()) {
            if installed.resolved_version.as_deref() == Some(resolved) && !options.force {
                return Err(Error::AlreadyInstalled {
                    name: name.to_string(),
                    version: resolved.to_string(),
                });
            }
        }

        let mut tx = self.journal.open(name, &self.root)?;
        let tx_id = tx.id().to_string();
        info!("{} - installing in transaction {}", name, tx_id);

        match self.plan_install(
            &mut tx,
            name,
            definition,
            &snapshot,
            existing.as_ref(),
            options.force,
        ) {
            Ok(planned) => {
                self.commit(tx, &planned.update)?;
                self.remove_backups(&planned.released);
                info!(
                    "{} - installed {} ({} files)",
                    name,
                    planned.entry.version_label(),
                    planned.entry.files.len()
                );
                Ok(planned.entry)
            }
            Err(cause) => Err(self.abort(
                tx,
                cause,
                OperationKind::Install,
                name,
                snapshot.version().map(str::to_string),
            )),
        }
    }

    fn plan_install(
        &self,
        tx: &mut Transaction,
        name: &str,
        definition: &PackageDefinition,
        snapshot: &Snapshot,
        existing: Option<&ManifestEntry>,
        force: bool,
    ) -> Result<PlannedInstall> {
        let context = StepContext {
            snapshot: snapshot.path(),
            root: &self.root,
            cancel: &self.cancel,
        };

        // Fingerprints the previous install recorded, checked once per target
        // before this transaction first touches it
        let recorded: HashMap<&str, &str> = existing
            .map(|entry| {
                entry
                    .files
                    .iter()
                    .map(|f| (f.path.as_str(), f.sha256.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        let mut vetted: HashSet<PathBuf> = HashSet::new();

        let mut vet = |target: &Path| -> Result<()> {
            let relative = relative_slash(target, &self.root)?;
            match self.manifest.owner_of(&relative)? {
                Some(owner) if owner != name => {
                    return Err(Error::FileConflict {
                        path: relative,
                        owner,
                    })
                }
                _ => {}
            }

            if !vetted.insert(target.to_path_buf()) {
                return Ok(());
            }
            let Some(&expected) = recorded.get(relative.as_str()) else {
                return Ok(());
            };
            match fingerprint_if_exists(target)? {
                Some(actual) if actual != expected => {
                    if !force {
                        return Err(Error::ModifiedFile {
                            path: relative,
                            package: name.to_string(),
                        });
                    }
                    warn!("{} - overwriting modified file {}", name, relative);
                    Ok(())
                }
                _ => Ok(()),
            }
        };

        for (index, step) in definition.steps.iter().enumerate() {
            self.cancel.check()?;
            debug!("{} - step {}: {}", name, index + 1, step.describe());
            if let StepOutcome::Skipped = step.execute(&context, tx, &mut vet)? {
                info!("{} - step {} skipped", name, index + 1);
            }
        }

        let written = tx.written_files();
        if written.is_empty() {
            return Err(Error::NoFiles(name.to_string()));
        }

        let mut update = ManifestUpdate::new(
            tx.id(),
            OperationKind::Install,
            name,
            snapshot.version().map(str::to_string),
        );

        // Files of the previous version this one no longer ships
        let mut directories: Vec<String> = Vec::new();
        if let Some(previous) = existing {
            let current: HashSet<String> = written
                .iter()
                .map(|p| relative_slash(p, &self.root))
                .collect::<Result<_>>()?;
            for file in previous.files.iter().filter(|f| !current.contains(&f.path)) {
                self.remove_tracked(tx, name, file, &mut update, None)?;
            }
            directories.extend(previous.directories.iter().cloned());
        }

        for (target, backup) in tx.overwritten_originals() {
            let relative = relative_slash(&target, &self.root)?;
            if self.manifest.owner_of(&relative)?.is_some()
                || self.manifest.original(&relative)?.is_some()
            {
                continue;
            }
            update
                .originals_saved
                .push(self.preserve_original(tx.id(), &relative, &backup)?);
        }

        for dir in tx.created_dirs() {
            let relative = relative_slash(&dir, &self.root)?;
            if !directories.contains(&relative) {
                directories.push(relative);
            }
        }

        let files = fingerprint_all(&written)?
            .into_iter()
            .map(|print| {
                Ok(ManifestFile {
                    path: relative_slash(&print.path, &self.root)?,
                    sha256: print.sha256,
                    size: print.size,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let entry = ManifestEntry {
            name: name.to_string(),
            source_used: snapshot.source().clone(),
            resolved_version: snapshot.version().map(str::to_string),
            files,
            directories,
            installed_at: chrono::Utc::now().to_rfc3339(),
            description: definition.description.clone(),
        };
        update.put = Some(entry.clone());
        let released = self.released_backups(&update)?;

        Ok(PlannedInstall {
            update,
            entry,
            released,
        })
    }

    /// Remove a package's files, keeping any that were modified since install
    pub fn uninstall(&self, name: &str) -> Result<UninstallReport> {
        let _lock = self
            .journal
            .locks()
            .acquire(&self.root, name, self.config.lock_timeout())?;
        self.recover_stale(Some(name))?;

        let entry = self
            .manifest
            .get(name)?
            .ok_or_else(|| Error::NotInstalled(name.to_string()))?;

        let mut tx = self.journal.open(name, &self.root)?;
        info!("{} - uninstalling in transaction {}", name, tx.id());

        let mut update = ManifestUpdate::new(
            tx.id(),
            OperationKind::Uninstall,
            name,
            entry.resolved_version.clone(),
        );
        update.remove = true;

        let mut report = UninstallReport {
            package: name.to_string(),
            ..Default::default()
        };

        let planned = entry
            .files
            .iter()
            .try_for_each(|file| {
                self.cancel.check()?;
                self.remove_tracked(&mut tx, name, file, &mut update, Some(&mut report))
            })
            .and_then(|()| self.remove_directories(&mut tx, &entry.directories))
            .and_then(|()| self.released_backups(&update));

        match planned {
            Ok(released) => {
                self.commit(tx, &update)?;
                self.remove_backups(&released);
                for orphan in &report.orphaned {
                    warn!("{} - kept modified file {}", name, orphan);
                }
                info!(
                    "{} - uninstalled ({} deleted, {} restored, {} orphaned)",
                    name,
                    report.deleted.len(),
                    report.restored.len(),
                    report.orphaned.len()
                );
                Ok(report)
            }
            Err(cause) => Err(self.abort(
                tx,
                cause,
                OperationKind::Uninstall,
                name,
                entry.resolved_version.clone(),
            )),
        }
    }

    /// Delete, restore, or orphan one file the package owned
    fn remove_tracked(
        &self,
        tx: &mut Transaction,
        name: &str,
        file: &ManifestFile,
        update: &mut ManifestUpdate,
        report: Option<&mut UninstallReport>,
    ) -> Result<()> {
        check_relative(&file.path)?;
        let target = self.root.join(&file.path);

        let outcome = match fingerprint_if_exists(&target)? {
            None => {
                debug!("{} - {} already removed", name, file.path);
                Removal::Missing
            }
            Some(current) if current == file.sha256 => match self.manifest.original(&file.path)? {
                Some(original) => {
                    tx.write_file(Path::new(&original.backup_path), &target)?;
                    update.originals_released.push(file.path.clone());
                    Removal::Restored
                }
                None => {
                    tx.delete_file(&target)?;
                    Removal::Deleted
                }
            },
            Some(_) => {
                update.orphans.push(OrphanedFile::new(
                    file.path.clone(),
                    name.to_string(),
                    file.sha256.clone(),
                ));
                Removal::Orphaned
            }
        };

        if let Some(report) = report {
            let list = match outcome {
                Removal::Deleted => &mut report.deleted,
                Removal::Restored => &mut report.restored,
                Removal::Orphaned => &mut report.orphaned,
                Removal::Missing => &mut report.missing,
            };
            list.push(file.path.clone());
        }
        Ok(())
    }

    /// Remove package-created directories that are now empty, deepest first
    fn remove_directories(&self, tx: &mut Transaction, directories: &[String]) -> Result<()> {
        let mut ordered: Vec<&String> = directories.iter().collect();
        ordered.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));

        for dir in ordered {
            check_relative(dir)?;
            let path = self.root.join(dir);
            let empty = match fs::read_dir(&path) {
                Ok(mut children) => children.next().is_none(),
                Err(_) => false,
            };
            if empty {
                tx.delete_dir(&path)?;
            } else if path.exists() {
                debug!("Keeping non-empty directory {}", path.display());
            }
        }
        Ok(())
    }

    /// Copy an overwritten file's backup somewhere that outlives the journal
    fn preserve_original(&self, tx_id: &str, relative: &str, backup: &Path) -> Result<OriginalFile> {
        let dir = self.originals_dir().join(tx_id);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::IoError(format!("Failed to create {}: {}", dir.display(), e)))?;

        let dest = dir.join(crate::hash::digest_str(relative));
        fs::copy(backup, &dest).map_err(|e| {
            Error::IoError(format!("Failed to preserve original {}: {}", relative, e))
        })?;
        debug!("Preserved original {} at {}", relative, dest.display());

        Ok(OriginalFile {
            path: relative.to_string(),
            backup_path: dest.to_string_lossy().into_owned(),
            sha256_hash: fingerprint(&dest)?,
            saved_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Backup copies of the originals an update hands back
    fn released_backups(&self, update: &ManifestUpdate) -> Result<Vec<PathBuf>> {
        update
            .originals_released
            .iter()
            .filter_map(|path| self.manifest.original(path).transpose())
            .map(|original| original.map(|o| PathBuf::from(o.backup_path)))
            .collect()
    }

    fn remove_backups(&self, backups: &[PathBuf]) {
        for backup in backups {
            if let Err(e) = fs::remove_file(backup) {
                warn!("Failed to remove {}: {}", backup.display(), e);
            }
            // Succeeds only once the transaction's last original is gone
            if let Some(parent) = backup.parent() {
                let _ = fs::remove_dir(parent);
            }
        }
    }

    fn originals_dir(&self) -> PathBuf {
        self.journal.dir().join(ORIGINALS_DIR)
    }

    /// Committing, manifest, Committed
    fn commit(&self, mut tx: Transaction, update: &ManifestUpdate) -> Result<()> {
        if let Err(cause) = tx.begin_commit() {
            return Err(self.abort(tx, cause, update.kind, &update.package, update.version.clone()));
        }

        if let Err(cause) = self.manifest.apply(update) {
            return Err(self.abort(tx, cause, update.kind, &update.package, update.version.clone()));
        }

        // The manifest holds the commit now; a failure here is finished by recovery
        let id = tx.id().to_string();
        if let Err(e) = tx.finish_commit() {
            warn!("Transaction {} committed but its journal was not finalized: {}", id, e);
        }
        Ok(())
    }

    /// Roll back after `cause`, returning the error to surface
    fn abort(
        &self,
        tx: Transaction,
        cause: Error,
        kind: OperationKind,
        package: &str,
        version: Option<String>,
    ) -> Error {
        let id = tx.id().to_string();
        warn!("{} - {} failed: {}", package, kind.as_str(), cause);

        if let Err(rollback) = tx.rollback() {
            return Error::RollbackFailed {
                cause: Box::new(cause),
                rollback: Box::new(rollback),
            };
        }

        self.discard_originals(&id);
        if let Err(e) = self.manifest.record_rollback(&id, kind, package, version) {
            warn!("Failed to record rollback of {}: {}", id, e);
        }
        cause
    }

    fn discard_originals(&self, tx_id: &str) {
        let dir = self.originals_dir().join(tx_id);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
    }

    /// Recover every stale transaction against this root
    pub fn recover(&self) -> Result<Vec<RecoveryOutcome>> {
        self.recover_stale(None)
    }

    /// Drop a transaction's journal without replaying it
    ///
    /// For journals recovery refuses as corrupt. Waits for the owning
    /// package's lock whenever the header still names one.
    pub fn discard_transaction(&self, id: &str) -> Result<()> {
        let _lock = match self.journal.owner(id)? {
            Some((root, package)) => Some(self.journal.locks().acquire(
                &root,
                &package,
                self.config.lock_timeout(),
            )?),
            None => None,
        };
        self.journal.discard(id)?;
        info!("Discarded transaction {}", id);
        Ok(())
    }

    fn recover_stale(&self, held: Option<&str>) -> Result<Vec<RecoveryOutcome>> {
        let outcomes = self
            .journal
            .recover(&self.root, held, |id| self.manifest.is_committed(id))?;

        for outcome in &outcomes {
            if let RecoveryOutcome::RolledBack { id, .. } = outcome {
                self.discard_originals(id);
            }
        }
        Ok(outcomes)
    }

    /// Files of an installed package whose content changed or vanished
    pub fn validate(&self, name: &str) -> Result<Vec<String>> {
        let entry = self
            .manifest
            .get(name)?
            .ok_or_else(|| Error::NotInstalled(name.to_string()))?;

        let mut invalid = Vec::new();
        for file in &entry.files {
            check_relative(&file.path)?;
            let current = fingerprint_if_exists(&self.root.join(&file.path))?;
            if current.as_deref() != Some(file.sha256.as_str()) {
                warn!("{} - checksum mismatch: {}", name, file.path);
                invalid.push(file.path.clone());
            }
        }
        Ok(invalid)
    }

    /// Pull the remote definition repository into the definition directory
    ///
    /// Returns whether any definition changed.
    pub fn update_definitions(&self) -> Result<bool> {
        let url = &self.config.git.url;
        let subdir = &self.config.git.definition_path;
        check_relative(subdir)?;
        info!("Retrieving definitions from {} ({})", url, subdir);

        if let Some(local) = file_url_path(url).filter(|p| p.is_dir()) {
            return self.definitions.sync_from(&local.join(subdir));
        }

        let staging = tempfile::tempdir()?;
        let download = staging.path().join("download");
        self.fetcher
            .backend()
            .fetch_file(url, &download)
            .map_err(|e| Error::DownloadError(e.to_string()))?;

        let unpacked = staging.path().join("unpacked");
        archive::unpack(&download, &unpacked).map_err(|e| Error::DownloadError(e.to_string()))?;

        let source = locate_subdir(&unpacked, subdir).ok_or_else(|| {
            Error::DownloadError(format!("{} has no {} directory", url, subdir))
        })?;
        let updated = self.definitions.sync_from(&source)?;
        if !updated {
            info!("Definitions are up to date");
        }
        Ok(updated)
    }

    /// Installed packages and their versions
    pub fn export(&self) -> Result<BTreeMap<String, Option<String>>> {
        Ok(self
            .manifest
            .list()?
            .into_iter()
            .map(|entry| (entry.name, entry.resolved_version))
            .collect())
    }

    /// Install every package of an export, continuing past failures
    pub fn import(
        &self,
        packages: &BTreeMap<String, Option<String>>,
        options: InstallOptions,
    ) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        for (name, version) in packages {
            match self.install(name, version.as_deref(), options) {
                Ok(_) => report.installed.push(name.clone()),
                Err(Error::AlreadyInstalled { .. }) => report.skipped.push(name.clone()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("{} - import failed: {}", name, e);
                    report.failed.push((name.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy)]
enum Removal {
    Deleted,
    Restored,
    Orphaned,
    Missing,
}

/// `subdir` inside an unpacked repository archive, which may wrap everything
/// in one top-level directory
fn locate_subdir(unpacked: &Path, subdir: &str) -> Option<PathBuf> {
    let direct = unpacked.join(subdir);
    if direct.is_dir() {
        return Some(direct);
    }

    let mut tops = fs::read_dir(unpacked)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir());
    let top = tops.next()?;
    if tops.next().is_some() {
        return None;
    }
    let nested = top.path().join(subdir);
    nested.is_dir().then_some(nested)
}
