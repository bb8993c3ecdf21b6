// src/hash.rs

//! Content fingerprints
//!
//! A fingerprint is the lowercase hex SHA-256 of a file's bytes. The manifest
//! records one per installed file; a mismatch at uninstall time means the file
//! was modified outside Packman.

use crate::error::{Error, Result};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Fingerprint and size of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Hash a file's content
pub fn fingerprint(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        Error::IoError(format!("Failed to open {} for hashing: {}", path.display(), e))
    })?;

    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| {
        Error::IoError(format!("Failed to read {} for hashing: {}", path.display(), e))
    })?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a file, or `None` when it no longer exists
pub fn fingerprint_if_exists(path: &Path) -> Result<Option<String>> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_file() => fingerprint(path).map(Some),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::IoError(format!(
            "Failed to stat {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Hash many files in parallel, preserving input order
pub fn fingerprint_all(paths: &[PathBuf]) -> Result<Vec<FileFingerprint>> {
    paths
        .par_iter()
        .map(|path| -> Result<FileFingerprint> {
            let sha256 = fingerprint(path)?;
            let size = path.metadata()?.len();
            Ok(FileFingerprint {
                path: path.clone(),
                sha256,
                size,
            })
        })
        .collect()
}

/// Hash an arbitrary string (used for lock and cache keys)
pub fn digest_str(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(
            fingerprint(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_missing_file() {
        let temp = TempDir::new().unwrap();
        assert_eq!(fingerprint_if_exists(&temp.path().join("gone")).unwrap(), None);
        assert!(fingerprint(&temp.path().join("gone")).is_err());
    }

    #[test]
    fn test_fingerprint_all_keeps_order() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::write(&a, b"aaaa").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let prints = fingerprint_all(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(prints[0].path, a);
        assert_eq!(prints[0].size, 4);
        assert_eq!(prints[1].path, b);
        assert_eq!(prints[1].size, 1);
    }
}
