// src/lock.rs

//! Package-scoped advisory locks
//!
//! One lock file per (root, package) pair under `<journal>/locks/`. Holding
//! the lock means holding an exclusive OS lock on that file; the kernel drops
//! it when the owner exits, however it exits, so a crashed owner never leaves
//! a lock behind. The file itself is permanent and carries the last owner's
//! PID for diagnostics only.

use crate::error::{Error, Result};
use crate::hash::digest_str;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Poll interval while waiting for a held lock
const LOCK_POLL: Duration = Duration::from_millis(100);

/// Creates and takes lock files in one directory
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

/// A held lock; released on drop
#[derive(Debug)]
pub struct LockGuard {
    // Closing the handle releases the OS lock
    _file: File,
    package: String,
}

impl LockGuard {
    pub fn package(&self) -> &str {
        &self.package
    }
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Acquire the lock, waiting up to `timeout` for a live holder to finish
    pub fn acquire(&self, root: &Path, package: &str, timeout: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_acquire(root, package)? {
                Ok(guard) => return Ok(guard),
                Err(pid) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Locked {
                            package: package.to_string(),
                            pid,
                        });
                    }
                    debug!("Waiting for lock on {} held by {}", package, pid);
                    std::thread::sleep(LOCK_POLL);
                }
            }
        }
    }

    /// Acquire the lock without waiting
    ///
    /// The inner `Err` carries the PID of the holder (0 if it has not been
    /// written yet).
    pub fn try_acquire(
        &self,
        root: &Path,
        package: &str,
    ) -> Result<std::result::Result<LockGuard, u32>> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::IoError(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;

        let path = self.lock_path(root, package);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                Error::IoError(format!("Failed to open lock {}: {}", path.display(), e))
            })?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(Err(read_owner(&path).unwrap_or(0))),
            Err(TryLockError::Error(e)) => {
                return Err(Error::IoError(format!(
                    "Failed to lock {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        writeln!(file, "{}", package)?;
        writeln!(file, "{}", root.display())?;
        file.sync_all()?;
        debug!("Acquired lock {}", path.display());

        Ok(Ok(LockGuard {
            _file: file,
            package: package.to_string(),
        }))
    }

    fn lock_path(&self, root: &Path, package: &str) -> PathBuf {
        let key = digest_str(&format!("{}\0{}", root.display(), package));
        self.dir.join(format!("{}.lock", &key[..32]))
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.lines().next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_sees_holder() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path().join("locks"));
        let root = temp.path().join("root");

        let guard = locks.try_acquire(&root, "mod-a").unwrap().unwrap();
        assert_eq!(guard.package(), "mod-a");

        let second = locks.try_acquire(&root, "mod-a").unwrap();
        assert_eq!(second.unwrap_err(), std::process::id());

        // Different package, same root: independent
        assert!(locks.try_acquire(&root, "mod-b").unwrap().is_ok());

        drop(guard);
        assert!(locks.try_acquire(&root, "mod-a").unwrap().is_ok());
    }

    #[test]
    fn test_acquire_times_out() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());
        let root = temp.path().join("root");

        let _guard = locks.try_acquire(&root, "mod-a").unwrap().unwrap();
        let result = locks.acquire(&root, "mod-a", Duration::from_millis(150));
        assert!(matches!(result, Err(Error::Locked { .. })));
    }

    #[test]
    fn test_leftover_lock_file_is_free() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());
        let root = temp.path().join("root");

        // Left behind by an owner that exited; nobody holds the OS lock
        fs::write(locks.lock_path(&root, "mod-a"), "4194303\nmod-a\n").unwrap();

        let guard = locks.try_acquire(&root, "mod-a").unwrap().unwrap();
        assert_eq!(
            read_owner(&locks.lock_path(&root, "mod-a")),
            Some(std::process::id())
        );
        drop(guard);
    }

    #[test]
    fn test_racing_acquirers_get_one_lock() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());
        let root = temp.path().join("root");
        fs::write(locks.lock_path(&root, "mod-a"), "garbage").unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let root = root.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.try_acquire(&root, "mod-a").unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    }
}
