// src/db/models.rs

//! Row models for the manifest database
//!
//! Each struct maps one table and carries its own insert/find/delete
//! helpers. Higher-level invariants (one owner per path, history written with
//! the manifest) live in [`crate::manifest`].

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::str::FromStr;

fn parse_column<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

/// An installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRow {
    pub id: Option<i64>,
    pub name: String,
    pub version: Option<String>,
    /// JSON-encoded source the package was fetched from
    pub source: String,
    pub description: Option<String>,
    pub installed_at: String,
    pub transaction_id: String,
}

impl PackageRow {
    /// Insert this package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO packages (name, version, source, description, installed_at, transaction_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &self.name,
                &self.version,
                &self.source,
                &self.description,
                &self.installed_at,
                &self.transaction_id,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, source, description, installed_at, transaction_id
             FROM packages WHERE name = ?1",
        )?;

        let package = stmt.query_row([name], Self::from_row).optional()?;

        Ok(package)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, source, description, installed_at, transaction_id
             FROM packages ORDER BY name",
        )?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Delete a package by name; its files go with it
    pub fn delete(conn: &Connection, name: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM packages WHERE name = ?1", [name])?;
        Ok(deleted > 0)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            version: row.get(2)?,
            source: row.get(3)?,
            description: row.get(4)?,
            installed_at: row.get(5)?,
            transaction_id: row.get(6)?,
        })
    }
}

/// A file owned by an installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFileRow {
    pub id: Option<i64>,
    pub package_id: i64,
    pub path: String,
    pub sha256_hash: String,
    pub size: i64,
}

impl PackageFileRow {
    pub fn new(package_id: i64, path: String, sha256_hash: String, size: i64) -> Self {
        Self {
            id: None,
            package_id,
            path,
            sha256_hash,
            size,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO package_files (package_id, path, sha256_hash, size)
             VALUES (?1, ?2, ?3, ?4)",
            params![&self.package_id, &self.path, &self.sha256_hash, &self.size],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Files of one package, in path order
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, path, sha256_hash, size
             FROM package_files WHERE package_id = ?1 ORDER BY path",
        )?;

        let files = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(files)
    }

    /// Name of the package owning `path`, if any
    pub fn find_owner(conn: &Connection, path: &str) -> Result<Option<String>> {
        let owner = conn
            .query_row(
                "SELECT p.name FROM package_files f
                 JOIN packages p ON p.id = f.package_id
                 WHERE f.path = ?1",
                [path],
                |row| row.get(0),
            )
            .optional()?;

        Ok(owner)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            path: row.get(2)?,
            sha256_hash: row.get(3)?,
            size: row.get(4)?,
        })
    }
}

/// A directory created by an installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDirectoryRow {
    pub package_id: i64,
    pub path: String,
}

impl PackageDirectoryRow {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO package_directories (package_id, path) VALUES (?1, ?2)",
            params![&self.package_id, &self.path],
        )?;
        Ok(())
    }

    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT package_id, path FROM package_directories WHERE package_id = ?1 ORDER BY path",
        )?;

        let dirs = stmt
            .query_map([package_id], |row| {
                Ok(Self {
                    package_id: row.get(0)?,
                    path: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(dirs)
    }
}

/// What a history row records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Install,
    Uninstall,
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Uninstall => "uninstall",
        }
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(OperationKind::Install),
            "uninstall" => Ok(OperationKind::Uninstall),
            _ => Err(format!("Invalid operation kind: {}", s)),
        }
    }
}

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Committed,
    RolledBack,
}

impl OperationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OperationStatus::Committed => "committed",
            OperationStatus::RolledBack => "rolled_back",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "committed" => Ok(OperationStatus::Committed),
            "rolled_back" => Ok(OperationStatus::RolledBack),
            _ => Err(format!("Invalid operation status: {}", s)),
        }
    }
}

/// One finished install or uninstall
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: Option<i64>,
    pub transaction_id: String,
    pub kind: OperationKind,
    pub package: String,
    pub version: Option<String>,
    pub status: OperationStatus,
    pub created_at: String,
}

impl HistoryEntry {
    pub fn new(
        transaction_id: String,
        kind: OperationKind,
        package: String,
        version: Option<String>,
        status: OperationStatus,
    ) -> Self {
        Self {
            id: None,
            transaction_id,
            kind,
            package,
            version,
            status,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO history (transaction_id, kind, package, version, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &self.transaction_id,
                self.kind.as_str(),
                &self.package,
                &self.version,
                self.status.as_str(),
                &self.created_at,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_transaction(conn: &Connection, transaction_id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, transaction_id, kind, package, version, status, created_at
             FROM history WHERE transaction_id = ?1",
        )?;

        let entry = stmt.query_row([transaction_id], Self::from_row).optional()?;

        Ok(entry)
    }

    /// Newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, transaction_id, kind, package, version, status, created_at
             FROM history ORDER BY id DESC",
        )?;

        let entries = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            transaction_id: row.get(1)?,
            kind: parse_column(row, 2)?,
            package: row.get(3)?,
            version: row.get(4)?,
            status: parse_column(row, 5)?,
            created_at: row.get(6)?,
        })
    }
}

/// A pre-existing file an install overwrote, kept for restoration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalFile {
    pub path: String,
    /// Absolute path of the permanent backup copy
    pub backup_path: String,
    pub sha256_hash: String,
    pub saved_at: String,
}

impl OriginalFile {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO original_files (path, backup_path, sha256_hash, saved_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![&self.path, &self.backup_path, &self.sha256_hash, &self.saved_at],
        )?;
        Ok(())
    }

    pub fn find_by_path(conn: &Connection, path: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT path, backup_path, sha256_hash, saved_at FROM original_files WHERE path = ?1",
        )?;

        let original = stmt.query_row([path], Self::from_row).optional()?;

        Ok(original)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT path, backup_path, sha256_hash, saved_at FROM original_files ORDER BY path",
        )?;

        let originals = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(originals)
    }

    pub fn delete(conn: &Connection, path: &str) -> Result<()> {
        conn.execute("DELETE FROM original_files WHERE path = ?1", [path])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(0)?,
            backup_path: row.get(1)?,
            sha256_hash: row.get(2)?,
            saved_at: row.get(3)?,
        })
    }
}

/// A modified file left in place when its package was removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedFile {
    pub id: Option<i64>,
    pub path: String,
    /// Package that owned the file
    pub package: String,
    /// Fingerprint recorded at install time
    pub sha256_hash: String,
    pub orphaned_at: String,
}

impl OrphanedFile {
    pub fn new(path: String, package: String, sha256_hash: String) -> Self {
        Self {
            id: None,
            path,
            package,
            sha256_hash,
            orphaned_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO orphaned_files (path, package, sha256_hash, orphaned_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![&self.path, &self.package, &self.sha256_hash, &self.orphaned_at],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, path, package, sha256_hash, orphaned_at FROM orphaned_files ORDER BY id",
        )?;

        let orphans = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(orphans)
    }

    /// Forget orphan records for a path that is owned again
    pub fn delete_by_path(conn: &Connection, path: &str) -> Result<()> {
        conn.execute("DELETE FROM orphaned_files WHERE path = ?1", [path])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            path: row.get(1)?,
            package: row.get(2)?,
            sha256_hash: row.get(3)?,
            orphaned_at: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn package(name: &str) -> PackageRow {
        PackageRow {
            id: None,
            name: name.to_string(),
            version: Some("1.0".to_string()),
            source: r#"{"github":"a/b"}"#.to_string(),
            description: None,
            installed_at: "2026-10-19T00:00:00Z".to_string(),
            transaction_id: "tx-1".to_string(),
        }
    }

    #[test]
    fn test_package_crud() {
        let (_temp, conn) = create_test_db();

        let mut row = package("example");
        let id = row.insert(&conn).unwrap();
        assert_eq!(row.id, Some(id));

        let found = PackageRow::find_by_name(&conn, "example").unwrap().unwrap();
        assert_eq!(found, row);
        assert_eq!(PackageRow::list_all(&conn).unwrap().len(), 1);

        assert!(PackageRow::delete(&conn, "example").unwrap());
        assert!(!PackageRow::delete(&conn, "example").unwrap());
        assert!(PackageRow::find_by_name(&conn, "example").unwrap().is_none());
    }

    #[test]
    fn test_files_cascade_with_package() {
        let (_temp, conn) = create_test_db();

        let id = package("example").insert(&conn).unwrap();
        PackageFileRow::new(id, "GameData/a.cfg".into(), "h".into(), 3)
            .insert(&conn)
            .unwrap();

        assert_eq!(
            PackageFileRow::find_owner(&conn, "GameData/a.cfg").unwrap(),
            Some("example".to_string())
        );

        PackageDirectoryRow {
            package_id: id,
            path: "GameData".into(),
        }
        .insert(&conn)
        .unwrap();
        assert_eq!(PackageDirectoryRow::find_by_package(&conn, id).unwrap().len(), 1);

        PackageRow::delete(&conn, "example").unwrap();
        assert!(PackageFileRow::find_by_package(&conn, id).unwrap().is_empty());
        assert!(PackageDirectoryRow::find_by_package(&conn, id).unwrap().is_empty());
        assert_eq!(PackageFileRow::find_owner(&conn, "GameData/a.cfg").unwrap(), None);
    }

    #[test]
    fn test_history_round_trip() {
        let (_temp, conn) = create_test_db();

        HistoryEntry::new(
            "tx-1".into(),
            OperationKind::Install,
            "example".into(),
            Some("1.0".into()),
            OperationStatus::Committed,
        )
        .insert(&conn)
        .unwrap();
        HistoryEntry::new(
            "tx-2".into(),
            OperationKind::Uninstall,
            "example".into(),
            None,
            OperationStatus::RolledBack,
        )
        .insert(&conn)
        .unwrap();

        let all = HistoryEntry::list_all(&conn).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].transaction_id, "tx-2");
        assert_eq!(all[0].status, OperationStatus::RolledBack);

        let found = HistoryEntry::find_by_transaction(&conn, "tx-1").unwrap().unwrap();
        assert_eq!(found.kind, OperationKind::Install);
        assert!(HistoryEntry::find_by_transaction(&conn, "tx-9").unwrap().is_none());
    }

    #[test]
    fn test_originals_and_orphans() {
        let (_temp, conn) = create_test_db();

        let original = OriginalFile {
            path: "settings.cfg".into(),
            backup_path: "/state/originals/x".into(),
            sha256_hash: "h".into(),
            saved_at: "now".into(),
        };
        original.insert(&conn).unwrap();
        assert_eq!(
            OriginalFile::find_by_path(&conn, "settings.cfg").unwrap(),
            Some(original.clone())
        );
        OriginalFile::delete(&conn, "settings.cfg").unwrap();
        assert!(OriginalFile::list_all(&conn).unwrap().is_empty());

        OrphanedFile::new("a.cfg".into(), "example".into(), "h".into())
            .insert(&conn)
            .unwrap();
        assert_eq!(OrphanedFile::list_all(&conn).unwrap()[0].package, "example");
        OrphanedFile::delete_by_path(&conn, "a.cfg").unwrap();
        assert!(OrphanedFile::list_all(&conn).unwrap().is_empty());
    }
}
