// src/journal/mod.rs

//! Write-ahead transaction journal
//!
//! Layout under the journal directory:
//!
//! ```text
//! <journal>/
//!   tx-<uuid>/journal.jsonl   header, entries, applied markers, state changes
//!   tx-<uuid>/backups/<seq>   pre-mutation copies for Overwrite/Delete
//!   locks/<key>.lock          package-scoped locks
//! ```
//!
//! Recovery is a linear scan of the transaction directories for one root.
//! Anything left Open or RollingBack is rolled back; anything left
//! Committing is finished or rolled back depending on whether the manifest
//! saw the commit.

pub mod record;
pub mod transaction;

pub use record::{EntryKind, Operation, TransactionState};
pub use transaction::{EntryStatus, JournalEntry, Transaction, WriteOutcome};

use crate::error::{Error, Result};
use crate::lock::LockManager;
use record::{read_records, Record, JOURNAL_FILE};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transaction::STAGING_PREFIX;

/// Age after which a staging directory is certainly abandoned
const STAGING_GRACE: Duration = Duration::from_secs(3600);
use tracing::{debug, error, info, warn};

/// What recovery did with one stale transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Mutations were undone
    RolledBack { id: String, package: String },
    /// The manifest already recorded the commit; only the journal was finalized
    Committed { id: String, package: String },
    /// A live process still owns the transaction
    InProgress { id: String, package: String },
}

/// Directory of per-transaction journals
#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock manager sharing this journal's directory
    pub fn locks(&self) -> LockManager {
        LockManager::new(self.dir.join("locks"))
    }

    /// Open a new transaction; the header is durable before this returns
    pub fn open(&self, package: &str, root: &Path) -> Result<Transaction> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::IoError(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;
        Transaction::create(&self.dir, package, root)
    }

    /// Ids of every transaction directory present
    pub fn transaction_ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && name.starts_with("tx-") {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load every unfinished transaction recorded against `root`
    ///
    /// Finished journals are garbage-collected along the way. A journal that
    /// cannot be read is `JournalCorruption` unless its header proves it
    /// belongs to another root.
    pub fn pending(&self, root: &Path) -> Result<Vec<Transaction>> {
        self.sweep_staging();
        let mut pending = Vec::new();

        for id in self.transaction_ids()? {
            let dir = self.dir.join(&id);
            let journal_path = dir.join(JOURNAL_FILE);

            if is_abandoned_open(&journal_path, &id)? {
                warn!("Discarding transaction {} that never finished opening", id);
                remove_dir(&dir)?;
                continue;
            }

            let transaction = match Transaction::load(&dir) {
                Ok(transaction) => transaction,
                Err(e) => match read_header(&journal_path, &id) {
                    Some((other, _)) if other != root => {
                        debug!("Skipping unreadable journal {} for {}", id, other.display());
                        continue;
                    }
                    _ => {
                        error!("Refusing to operate on {}: {}", root.display(), e);
                        return Err(e);
                    }
                },
            };

            if transaction.root() != root {
                continue;
            }

            if transaction.state().is_terminal() {
                debug!("Collecting finished transaction {}", id);
                transaction.discard()?;
                continue;
            }

            pending.push(transaction);
        }

        Ok(pending)
    }

    /// Drive every stale transaction for `root` to a terminal state
    ///
    /// `held` names the package whose lock the caller already holds; other
    /// packages' transactions are only touched after taking their lock, so a
    /// concurrent live operation is never disturbed. `is_committed` reports
    /// whether the manifest recorded a transaction id.
    pub fn recover<F>(
        &self,
        root: &Path,
        held: Option<&str>,
        is_committed: F,
    ) -> Result<Vec<RecoveryOutcome>>
    where
        F: Fn(&str) -> Result<bool>,
    {
        let locks = self.locks();
        let mut outcomes = Vec::new();

        for transaction in self.pending(root)? {
            let id = transaction.id().to_string();
            let package = transaction.package().to_string();

            let (_guard, transaction) = if held == Some(package.as_str()) {
                (None, transaction)
            } else {
                match locks.try_acquire(root, &package)? {
                    // The owner may have moved on between the scan and the lock
                    Ok(guard) => match self.reload(&id)? {
                        Some(current) => (Some(guard), current),
                        None => continue,
                    },
                    Err(pid) => {
                        debug!("Transaction {} is owned by live process {}", id, pid);
                        outcomes.push(RecoveryOutcome::InProgress { id, package });
                        continue;
                    }
                }
            };

            warn!(
                "Recovering transaction {} for {} (state: {})",
                id,
                package,
                transaction.state()
            );

            let outcome = if transaction.state() == TransactionState::Committing
                && is_committed(&id)?
            {
                transaction.finish_commit()?;
                RecoveryOutcome::Committed { id, package }
            } else {
                transaction.rollback()?;
                RecoveryOutcome::RolledBack { id, package }
            };

            info!("Recovery: {:?}", outcome);
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Fresh state of a transaction, or `None` once it has finished
    fn reload(&self, id: &str) -> Result<Option<Transaction>> {
        let dir = self.dir.join(id);
        if !dir.is_dir() {
            return Ok(None);
        }
        let transaction = Transaction::load(&dir)?;
        if transaction.state().is_terminal() {
            transaction.discard()?;
            return Ok(None);
        }
        Ok(Some(transaction))
    }

    /// Remove staging directories left by a crash during `open`
    ///
    /// They never hold journaled mutations. Young ones may belong to an
    /// `open` still in progress and are left alone.
    fn sweep_staging(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok());
            if age.is_some_and(|age| age >= STAGING_GRACE) {
                debug!("Removing abandoned staging directory {}", name);
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!("Failed to remove {}: {}", entry.path().display(), e);
                }
            }
        }
    }

    /// Root and package named in a transaction's header, if it is readable
    pub fn owner(&self, id: &str) -> Result<Option<(PathBuf, String)>> {
        check_id(id)?;
        Ok(read_header(&self.dir.join(id).join(JOURNAL_FILE), id))
    }

    /// Delete a transaction's journal without replaying it
    ///
    /// This is the manual escape hatch for a corrupt journal; the caller is
    /// responsible for having inspected the root.
    pub fn discard(&self, id: &str) -> Result<()> {
        check_id(id)?;
        let dir = self.dir.join(id);
        if !dir.is_dir() {
            return Err(Error::IoError(format!("No transaction {}", id)));
        }
        warn!("Discarding journal {} without replay", id);
        remove_dir(&dir)
    }
}

fn check_id(id: &str) -> Result<()> {
    if !id.starts_with("tx-") || id.contains(['/', '\\']) || id.contains("..") {
        return Err(Error::PathTraversal(id.to_string()));
    }
    Ok(())
}

/// A `tx-*` directory whose journal holds no records was never opened
///
/// `open` publishes directories only after their header is durable, so this
/// is leftover damage rather than a live transaction.
fn is_abandoned_open(journal_path: &Path, id: &str) -> Result<bool> {
    if !journal_path.exists() {
        return Ok(true);
    }
    match read_records(journal_path, id) {
        Ok(contents) => Ok(contents.records.is_empty()),
        Err(_) => Ok(false),
    }
}

/// Best-effort read of the root and package named in a journal's first line
fn read_header(journal_path: &Path, id: &str) -> Option<(PathBuf, String)> {
    let raw = fs::read_to_string(journal_path).ok()?;
    let first = raw.lines().next()?;
    match serde_json::from_str::<Record>(first) {
        Ok(Record::Header { root, package, .. }) => Some((root, package)),
        _ => {
            debug!("Journal {} has no readable header", id);
            None
        }
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::IoError(format!(
            "Failed to remove {}: {}",
            dir.display(),
            e
        ))),
    }
}
