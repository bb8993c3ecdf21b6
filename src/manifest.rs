// src/manifest.rs

//! Manifest store
//!
//! Durable record of which package owns which file under the root, with the
//! fingerprint each file had when it was installed. Every write that belongs
//! to one engine operation (package rows, files, originals, orphans and the
//! history row) lands in a single SQLite transaction, so the history row is
//! proof that the manifest saw the commit.

use crate::db::{
    self,
    models::{
        HistoryEntry, OperationKind, OperationStatus, OriginalFile, OrphanedFile,
        PackageDirectoryRow, PackageFileRow, PackageRow,
    },
};
use crate::definition::SourceSpec;
use crate::error::{Error, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One file tracked for a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Relative to the root, `/`-separated
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// Everything recorded about one installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub source_used: SourceSpec,
    /// `None` when the source is unversioned
    pub resolved_version: Option<String>,
    pub files: Vec<ManifestFile>,
    /// Directories the package created, relative to the root
    #[serde(default)]
    pub directories: Vec<String>,
    pub installed_at: String,
    pub description: Option<String>,
}

impl ManifestEntry {
    pub fn file(&self, path: &str) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn version_label(&self) -> &str {
        self.resolved_version.as_deref().unwrap_or("(unversioned)")
    }
}

/// All manifest writes belonging to one committed operation
#[derive(Debug, Clone)]
pub struct ManifestUpdate {
    pub transaction_id: String,
    pub kind: OperationKind,
    pub package: String,
    pub version: Option<String>,
    /// Replace (or create) the package's entry
    pub put: Option<ManifestEntry>,
    /// Drop the package's entry
    pub remove: bool,
    pub originals_saved: Vec<OriginalFile>,
    /// Paths whose preserved original was restored or released
    pub originals_released: Vec<String>,
    pub orphans: Vec<OrphanedFile>,
}

impl ManifestUpdate {
    pub fn new(
        transaction_id: &str,
        kind: OperationKind,
        package: &str,
        version: Option<String>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            kind,
            package: package.to_string(),
            version,
            put: None,
            remove: false,
            originals_saved: Vec::new(),
            originals_released: Vec::new(),
            orphans: Vec::new(),
        }
    }
}

/// SQLite-backed manifest
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    /// Open (creating and migrating if needed) the manifest at `path`
    pub fn open(path: &Path) -> Result<Self> {
        db::init(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        db::open(&self.path)
    }

    pub fn get(&self, name: &str) -> Result<Option<ManifestEntry>> {
        let conn = self.connect()?;
        match PackageRow::find_by_name(&conn, name)? {
            Some(row) => Ok(Some(load_entry(&conn, row)?)),
            None => Ok(None),
        }
    }

    /// Every installed package, by name
    pub fn list(&self) -> Result<Vec<ManifestEntry>> {
        let conn = self.connect()?;
        PackageRow::list_all(&conn)?
            .into_iter()
            .map(|row| load_entry(&conn, row))
            .collect()
    }

    /// Insert or replace an entry outside any engine operation
    pub fn put(&self, entry: &ManifestEntry) -> Result<()> {
        let mut conn = self.connect()?;
        db::transaction(&mut conn, |tx| put_entry(tx, entry, "manual"))
    }

    /// Remove an entry outside any engine operation; returns whether it existed
    pub fn remove(&self, name: &str) -> Result<bool> {
        let conn = self.connect()?;
        PackageRow::delete(&conn, name)
    }

    /// Package owning a root-relative path
    pub fn owner_of(&self, path: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        PackageFileRow::find_owner(&conn, path)
    }

    pub fn original(&self, path: &str) -> Result<Option<OriginalFile>> {
        let conn = self.connect()?;
        OriginalFile::find_by_path(&conn, path)
    }

    pub fn orphans(&self) -> Result<Vec<OrphanedFile>> {
        let conn = self.connect()?;
        OrphanedFile::list_all(&conn)
    }

    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        let conn = self.connect()?;
        HistoryEntry::list_all(&conn)
    }

    /// Whether a transaction's commit reached the manifest
    pub fn is_committed(&self, transaction_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        Ok(HistoryEntry::find_by_transaction(&conn, transaction_id)?
            .is_some_and(|h| h.status == OperationStatus::Committed))
    }

    /// Apply every write of a committing operation atomically
    pub fn apply(&self, update: &ManifestUpdate) -> Result<()> {
        debug!(
            "Applying manifest update for {} ({})",
            update.package, update.transaction_id
        );

        let mut conn = self.connect()?;
        db::transaction(&mut conn, |tx| {
            if update.remove || update.put.is_some() {
                PackageRow::delete(tx, &update.package)?;
            }
            if let Some(entry) = &update.put {
                put_entry(tx, entry, &update.transaction_id)?;
                for file in &entry.files {
                    OrphanedFile::delete_by_path(tx, &file.path)?;
                }
            }
            for path in &update.originals_released {
                OriginalFile::delete(tx, path)?;
            }
            for original in &update.originals_saved {
                original.insert(tx)?;
            }
            for orphan in &update.orphans {
                orphan.clone().insert(tx)?;
            }

            HistoryEntry::new(
                update.transaction_id.clone(),
                update.kind,
                update.package.clone(),
                update.version.clone(),
                OperationStatus::Committed,
            )
            .insert(tx)?;
            Ok(())
        })
    }

    /// Record an operation that was rolled back; the manifest itself is untouched
    pub fn record_rollback(
        &self,
        transaction_id: &str,
        kind: OperationKind,
        package: &str,
        version: Option<String>,
    ) -> Result<()> {
        let conn = self.connect()?;
        if HistoryEntry::find_by_transaction(&conn, transaction_id)?.is_some() {
            return Ok(());
        }
        HistoryEntry::new(
            transaction_id.to_string(),
            kind,
            package.to_string(),
            version,
            OperationStatus::RolledBack,
        )
        .insert(&conn)?;
        Ok(())
    }
}

fn put_entry(conn: &Connection, entry: &ManifestEntry, transaction_id: &str) -> Result<()> {
    PackageRow::delete(conn, &entry.name)?;

    let mut row = PackageRow {
        id: None,
        name: entry.name.clone(),
        version: entry.resolved_version.clone(),
        source: serde_json::to_string(&entry.source_used)?,
        description: entry.description.clone(),
        installed_at: entry.installed_at.clone(),
        transaction_id: transaction_id.to_string(),
    };
    let package_id = row.insert(conn)?;

    for file in &entry.files {
        let size = i64::try_from(file.size)
            .map_err(|_| Error::IoError(format!("{} is too large to record", file.path)))?;
        PackageFileRow::new(package_id, file.path.clone(), file.sha256.clone(), size)
            .insert(conn)?;
    }
    for dir in &entry.directories {
        PackageDirectoryRow {
            package_id,
            path: dir.clone(),
        }
        .insert(conn)?;
    }
    Ok(())
}

fn load_entry(conn: &Connection, row: PackageRow) -> Result<ManifestEntry> {
    let package_id = row
        .id
        .ok_or_else(|| Error::InitError("package row without id".to_string()))?;
    let source_used: SourceSpec = serde_json::from_str(&row.source)?;

    let files = PackageFileRow::find_by_package(conn, package_id)?
        .into_iter()
        .map(|f| ManifestFile {
            path: f.path,
            sha256: f.sha256_hash,
            size: u64::try_from(f.size).unwrap_or_default(),
        })
        .collect();
    let directories = PackageDirectoryRow::find_by_package(conn, package_id)?
        .into_iter()
        .map(|d| d.path)
        .collect();

    Ok(ManifestEntry {
        name: row.name,
        source_used,
        resolved_version: row.version,
        files,
        directories,
        installed_at: row.installed_at,
        description: row.description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str, files: &[&str]) -> ManifestEntry {
        ManifestEntry {
            name: name.to_string(),
            source_used: SourceSpec::GitHub("owner/repo".to_string()),
            resolved_version: Some("1.0.0".to_string()),
            files: files
                .iter()
                .map(|p| ManifestFile {
                    path: p.to_string(),
                    sha256: "abc".to_string(),
                    size: 3,
                })
                .collect(),
            directories: vec!["GameData/Example".to_string()],
            installed_at: "2026-10-19T00:00:00Z".to_string(),
            description: Some("test".to_string()),
        }
    }

    fn store() -> (TempDir, ManifestStore) {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(&temp.path().join("manifest.db")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_put_get_remove() {
        let (_temp, store) = store();
        let e = entry("example", &["GameData/Example/a.cfg", "GameData/Example/b.dll"]);

        store.put(&e).unwrap();
        assert_eq!(store.get("example").unwrap(), Some(e.clone()));
        assert_eq!(store.list().unwrap(), vec![e]);
        assert_eq!(
            store.owner_of("GameData/Example/a.cfg").unwrap(),
            Some("example".to_string())
        );

        assert!(store.remove("example").unwrap());
        assert_eq!(store.get("example").unwrap(), None);
        assert_eq!(store.owner_of("GameData/Example/a.cfg").unwrap(), None);
    }

    #[test]
    fn test_apply_records_history_atomically() {
        let (_temp, store) = store();

        let mut update = ManifestUpdate::new(
            "tx-1",
            OperationKind::Install,
            "example",
            Some("1.0.0".to_string()),
        );
        update.put = Some(entry("example", &["a.cfg"]));
        store.apply(&update).unwrap();

        assert!(store.is_committed("tx-1").unwrap());
        assert!(!store.is_committed("tx-2").unwrap());
        assert!(store.get("example").unwrap().is_some());

        // Same transaction id twice violates the history constraint; nothing lands
        let mut again = update.clone();
        again.put = Some(entry("example", &["a.cfg", "b.cfg"]));
        assert!(store.apply(&again).is_err());
        assert_eq!(store.get("example").unwrap().unwrap().files.len(), 1);
    }

    #[test]
    fn test_apply_remove_with_orphans_and_originals() {
        let (_temp, store) = store();
        store.put(&entry("example", &["a.cfg", "settings.cfg"])).unwrap();

        let mut install = ManifestUpdate::new("tx-0", OperationKind::Install, "other", None);
        install.originals_saved.push(OriginalFile {
            path: "settings.cfg".to_string(),
            backup_path: "/state/originals/1".to_string(),
            sha256_hash: "orig".to_string(),
            saved_at: "now".to_string(),
        });
        store.apply(&install).unwrap();

        let mut update = ManifestUpdate::new("tx-1", OperationKind::Uninstall, "example", None);
        update.remove = true;
        update.originals_released.push("settings.cfg".to_string());
        update
            .orphans
            .push(OrphanedFile::new("a.cfg".into(), "example".into(), "abc".into()));
        store.apply(&update).unwrap();

        assert!(store.get("example").unwrap().is_none());
        assert!(store.original("settings.cfg").unwrap().is_none());
        assert_eq!(store.orphans().unwrap()[0].path, "a.cfg");

        // Reinstalling a package that owns the orphaned path clears the orphan record
        let mut reinstall = ManifestUpdate::new("tx-2", OperationKind::Install, "example", None);
        reinstall.put = Some(entry("example", &["a.cfg"]));
        store.apply(&reinstall).unwrap();
        assert!(store.orphans().unwrap().is_empty());

        let history = store.history().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].transaction_id, "tx-2");
    }

    #[test]
    fn test_record_rollback_is_not_a_commit() {
        let (_temp, store) = store();
        store
            .record_rollback("tx-9", OperationKind::Install, "example", None)
            .unwrap();
        store
            .record_rollback("tx-9", OperationKind::Install, "example", None)
            .unwrap();

        assert!(!store.is_committed("tx-9").unwrap());
        assert_eq!(store.history().unwrap()[0].status, OperationStatus::RolledBack);
    }
}
