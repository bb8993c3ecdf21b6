// src/db/mod.rs

//! Database layer for the manifest store
//!
//! This module handles all SQLite operations including:
//! - Database initialization and schema migration
//! - Connection management
//! - Transaction handling

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::debug;

const CONNECTION_PRAGMAS: &str = "
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

/// Create (if needed) and migrate the manifest database at `db_path`
///
/// Idempotent: calling it on an existing, current database is safe.
pub fn init(db_path: &Path) -> Result<Connection> {
    debug!("Initializing database at: {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::InitError(format!("Failed to create database directory: {}", e))
            })?;
        }
    }

    let conn = Connection::open(db_path)?;

    // WAL lets concurrent operations on different packages read while one commits
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = FULL;
        ",
    )?;
    conn.execute_batch(CONNECTION_PRAGMAS)?;

    schema::migrate(&conn)?;
    Ok(conn)
}

/// Open an already initialized database
pub fn open(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(Error::InitError(format!(
            "Database not found at path: {}",
            db_path.display()
        )));
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch(CONNECTION_PRAGMAS)?;
    Ok(conn)
}

/// Run `f` inside one SQLite transaction
///
/// The transaction commits only if `f` returns `Ok`; any error rolls it back.
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&rusqlite::Transaction) -> Result<T>,
{
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_database() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("state/manifest.db");

        init(&db_path).unwrap();
        assert!(db_path.exists());
        // Second init is a no-op
        init(&db_path).unwrap();
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open(Path::new("/nonexistent/path/db.sqlite"));
        assert!(matches!(result, Err(Error::InitError(_))));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let temp = TempDir::new().unwrap();
        let mut conn = init(&temp.path().join("manifest.db")).unwrap();

        let result: Result<()> = transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO packages (name, source, installed_at, transaction_id)
                 VALUES ('a', 'url', 'now', 'tx')",
                [],
            )?;
            Err(Error::Cancelled)
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM packages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
