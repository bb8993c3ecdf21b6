// src/db/schema.rs

//! Manifest schema and migrations
//!
//! The schema version is tracked in its own table; `migrate` applies every
//! missing version in order, so opening an old manifest upgrades it in place.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version > SCHEMA_VERSION {
        return Err(Error::InitError(format!(
            "manifest schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }
    if current_version == SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying manifest migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// - packages: one row per installed package
/// - package_files: files each package owns, with fingerprints
/// - package_directories: directories each package created
/// - history: every committed or rolled-back operation
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            version TEXT,
            source TEXT NOT NULL,
            description TEXT,
            installed_at TEXT NOT NULL,
            transaction_id TEXT NOT NULL
        );

        -- Paths are relative to the install root, '/'-separated
        CREATE TABLE package_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            path TEXT NOT NULL UNIQUE,
            sha256_hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_files_package ON package_files(package_id);

        -- Directories an install created, removed again when empty
        CREATE TABLE package_directories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            UNIQUE(package_id, path),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE TABLE history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL CHECK(kind IN ('install', 'uninstall')),
            package TEXT NOT NULL,
            version TEXT,
            status TEXT NOT NULL CHECK(status IN ('committed', 'rolled_back')),
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_history_package ON history(package);
        ",
    )?;

    Ok(())
}

/// Schema Version 2: original-file preservation and the orphan registry
///
/// - original_files: pre-existing files an install overwrote, with the
///   location of their permanent backup
/// - orphaned_files: externally modified files left behind by an uninstall
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE original_files (
            path TEXT PRIMARY KEY,
            backup_path TEXT NOT NULL,
            sha256_hash TEXT NOT NULL,
            saved_at TEXT NOT NULL
        );

        CREATE TABLE orphaned_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            package TEXT NOT NULL,
            sha256_hash TEXT NOT NULL,
            orphaned_at TEXT NOT NULL
        );

        CREATE INDEX idx_orphaned_files_path ON orphaned_files(path);
        ",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        assert_eq!(get_schema_version(&conn).unwrap(), 0);
        set_schema_version(&conn, 1).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "packages",
            "package_files",
            "package_directories",
            "history",
            "original_files",
            "orphaned_files",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_from_v1() {
        let (_temp, conn) = create_test_db();
        init_schema_version(&conn).unwrap();
        migrate_v1(&conn).unwrap();
        set_schema_version(&conn, 1).unwrap();

        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let (_temp, conn) = create_test_db();
        init_schema_version(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();

        assert!(matches!(migrate(&conn), Err(Error::InitError(_))));
    }

    #[test]
    fn test_file_paths_unique_across_packages() {
        let (_temp, conn) = create_test_db();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        migrate(&conn).unwrap();

        for name in ["a", "b"] {
            conn.execute(
                "INSERT INTO packages (name, source, installed_at, transaction_id)
                 VALUES (?1, 'url', 'now', 'tx')",
                [name],
            )
            .unwrap();
        }
        conn.execute(
            "INSERT INTO package_files (package_id, path, sha256_hash, size) VALUES (1, 'x', 'h', 1)",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO package_files (package_id, path, sha256_hash, size) VALUES (2, 'x', 'h', 1)",
            [],
        );
        assert!(result.is_err());
    }
}
