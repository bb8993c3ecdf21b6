// src/journal/transaction.rs

//! A single write-ahead transaction against one install root
//!
//! Every filesystem mutation goes through a `Transaction` helper which, in
//! order: copies a backup of anything about to be replaced or removed, appends
//! the journal entry and syncs it, performs the mutation, and finally marks
//! the entry applied. Rollback replays the entries in reverse.

use super::record::{
    read_records, sync_dir, EntryKind, JournalWriter, Operation, Record, TransactionState,
    FORMAT_VERSION, JOURNAL_FILE,
};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const BACKUP_DIR: &str = "backups";

/// Prefix of a transaction directory that is still being assembled
pub(super) const STAGING_PREFIX: &str = ".staging-";

/// Whether a journaled mutation has reached the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Applied,
}

/// One planned mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: usize,
    pub operation: Operation,
    pub kind: EntryKind,
    pub target: PathBuf,
    /// Relative to the transaction directory; set for Overwrite/Delete of files
    pub backup: Option<PathBuf>,
    pub status: EntryStatus,
}

/// What `write_file` did to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Overwritten,
}

/// The unit of atomicity for one install or uninstall
#[derive(Debug)]
pub struct Transaction {
    id: String,
    package: String,
    root: PathBuf,
    dir: PathBuf,
    created_at: String,
    writer: JournalWriter,
    entries: Vec<JournalEntry>,
    state: TransactionState,
}

impl Transaction {
    /// Allocate a transaction directory and persist its header
    ///
    /// The directory is assembled under a staging name and renamed into
    /// place, so a `tx-*` directory always starts with a durable header.
    pub(super) fn create(journal_dir: &Path, package: &str, root: &Path) -> Result<Self> {
        let id = format!("tx-{}", Uuid::new_v4());
        let staging = journal_dir.join(format!("{}{}", STAGING_PREFIX, id));
        let dir = journal_dir.join(&id);
        let created_at = chrono::Utc::now().to_rfc3339();

        let staged = stage_header(&staging, &id, package, root, &created_at);
        if let Err(e) = staged.and_then(|()| {
            fs::rename(&staging, &dir).map_err(|e| {
                Error::IoError(format!("Failed to publish {}: {}", dir.display(), e))
            })
        }) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        sync_dir(journal_dir)?;

        let journal_path = dir.join(JOURNAL_FILE);
        let len = fs::metadata(&journal_path)?.len();
        let writer = JournalWriter::reopen(&journal_path, len)?;

        debug!("Opened transaction {} for {} in {}", id, package, root.display());

        Ok(Self {
            id,
            package: package.to_string(),
            root: root.to_path_buf(),
            dir,
            created_at,
            writer,
            entries: Vec::new(),
            state: TransactionState::Open,
        })
    }

    /// Rebuild a transaction from its journal directory
    pub(super) fn load(dir: &Path) -> Result<Self> {
        let fallback_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let corrupt = |reason: String| Error::JournalCorruption {
            transaction: fallback_id.clone(),
            reason,
        };

        let journal_path = dir.join(JOURNAL_FILE);
        let contents = read_records(&journal_path, &fallback_id)?;
        let mut records = contents.records.into_iter();

        let (id, package, root, created_at) = match records.next() {
            Some(Record::Header {
                format,
                id,
                package,
                root,
                created_at,
            }) => {
                if format != FORMAT_VERSION {
                    return Err(corrupt(format!("unsupported journal format {}", format)));
                }
                (id, package, root, created_at)
            }
            Some(_) => return Err(corrupt("first record is not a header".to_string())),
            None => return Err(corrupt("journal has no header".to_string())),
        };

        let mut entries: Vec<JournalEntry> = Vec::new();
        let mut state = TransactionState::Open;
        for record in records {
            match record {
                Record::Header { .. } => {
                    return Err(corrupt("duplicate header".to_string()));
                }
                Record::Entry {
                    seq,
                    operation,
                    kind,
                    target,
                    backup,
                } => {
                    if seq != entries.len() {
                        return Err(corrupt(format!(
                            "entry {} out of order (expected {})",
                            seq,
                            entries.len()
                        )));
                    }
                    entries.push(JournalEntry {
                        seq,
                        operation,
                        kind,
                        target,
                        backup,
                        status: EntryStatus::Pending,
                    });
                }
                Record::Applied { seq } => {
                    let entry = entries
                        .get_mut(seq)
                        .ok_or_else(|| corrupt(format!("applied marker for unknown entry {}", seq)))?;
                    entry.status = EntryStatus::Applied;
                }
                Record::State { state: next } => state = next,
            }
        }

        let writer = JournalWriter::reopen(&journal_path, contents.valid_len)?;

        Ok(Self {
            id,
            package,
            root,
            dir: dir.to_path_buf(),
            created_at,
            writer,
            entries,
            state,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Record a planned mutation and flush it before returning
    ///
    /// `backup_of` is copied into the transaction's backup area before the
    /// entry is written, so a recorded Overwrite/Delete always has its backup.
    pub fn record(
        &mut self,
        operation: Operation,
        kind: EntryKind,
        target: &Path,
        backup_of: Option<&Path>,
    ) -> Result<usize> {
        self.ensure_state(TransactionState::Open)?;
        self.ensure_within_root(target)?;

        let seq = self.entries.len();
        let backup = match backup_of {
            Some(source) => {
                let relative = Path::new(BACKUP_DIR).join(seq.to_string());
                let dest = self.dir.join(&relative);
                copy_synced(source, &dest)?;
                Some(relative)
            }
            None => None,
        };

        self.writer.append(&Record::Entry {
            seq,
            operation,
            kind,
            target: target.to_path_buf(),
            backup: backup.clone(),
        })?;

        self.entries.push(JournalEntry {
            seq,
            operation,
            kind,
            target: target.to_path_buf(),
            backup,
            status: EntryStatus::Pending,
        });
        Ok(seq)
    }

    /// Mark a recorded entry as having reached the filesystem
    pub fn mark_applied(&mut self, seq: usize) -> Result<()> {
        self.writer.append(&Record::Applied { seq })?;
        if let Some(entry) = self.entries.get_mut(seq) {
            entry.status = EntryStatus::Applied;
        }
        Ok(())
    }

    /// Create a directory (the parent must exist)
    pub fn create_dir(&mut self, path: &Path) -> Result<()> {
        let seq = self.record(Operation::Create, EntryKind::Directory, path, None)?;
        fs::create_dir(path)
            .map_err(|e| Error::IoError(format!("Failed to create {}: {}", path.display(), e)))?;
        self.mark_applied(seq)
    }

    /// Create every missing ancestor of `path` inside the root, then `path` itself
    pub fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        self.ensure_within_root(path)?;

        let mut missing = Vec::new();
        let mut current = Some(path);
        while let Some(dir) = current {
            if dir.is_dir() || dir == self.root {
                break;
            }
            missing.push(dir.to_path_buf());
            current = dir.parent();
        }

        for dir in missing.iter().rev() {
            self.create_dir(dir)?;
        }
        Ok(())
    }

    /// Copy `source` to `target`, backing up any existing file first
    pub fn write_file(&mut self, source: &Path, target: &Path) -> Result<WriteOutcome> {
        let existing = target.symlink_metadata().ok();
        if existing.as_ref().is_some_and(|m| m.is_dir()) {
            return Err(Error::IoError(format!(
                "Cannot write file over directory {}",
                target.display()
            )));
        }

        let (operation, outcome, backup_of) = match existing {
            Some(_) => (Operation::Overwrite, WriteOutcome::Overwritten, Some(target)),
            None => (Operation::Create, WriteOutcome::Created, None),
        };

        let seq = self.record(operation, EntryKind::File, target, backup_of)?;
        copy_synced(source, target)?;
        self.mark_applied(seq)?;
        Ok(outcome)
    }

    /// Remove a file after backing it up
    pub fn delete_file(&mut self, target: &Path) -> Result<()> {
        let seq = self.record(Operation::Delete, EntryKind::File, target, Some(target))?;
        fs::remove_file(target)
            .map_err(|e| Error::IoError(format!("Failed to remove {}: {}", target.display(), e)))?;
        self.mark_applied(seq)
    }

    /// Remove an empty directory
    pub fn delete_dir(&mut self, target: &Path) -> Result<()> {
        let seq = self.record(Operation::Delete, EntryKind::Directory, target, None)?;
        fs::remove_dir(target)
            .map_err(|e| Error::IoError(format!("Failed to remove {}: {}", target.display(), e)))?;
        self.mark_applied(seq)
    }

    /// Files this transaction created or overwrote and has not since deleted
    pub fn written_files(&self) -> Vec<PathBuf> {
        let mut live: Vec<PathBuf> = Vec::new();
        let mut seen = HashSet::new();
        for entry in self.entries.iter().filter(|e| e.kind == EntryKind::File) {
            match entry.operation {
                Operation::Create | Operation::Overwrite => {
                    if seen.insert(entry.target.clone()) {
                        live.push(entry.target.clone());
                    }
                }
                Operation::Delete => {
                    if seen.remove(&entry.target) {
                        live.retain(|p| p != &entry.target);
                    }
                }
            }
        }
        live
    }

    /// Directories this transaction created
    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Directory && e.operation == Operation::Create)
            .map(|e| e.target.clone())
            .collect()
    }

    /// Files that existed before this transaction and were overwritten, with their backups
    pub fn overwritten_originals(&self) -> Vec<(PathBuf, PathBuf)> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .filter(|e| seen.insert(e.target.clone()))
            .filter(|e| e.operation == Operation::Overwrite)
            .filter_map(|e| e.backup.as_ref().map(|b| (e.target.clone(), self.dir.join(b))))
            .collect()
    }

    /// Enter the Committing state; the manifest may be written after this
    pub fn begin_commit(&mut self) -> Result<()> {
        self.ensure_state(TransactionState::Open)?;
        self.set_state(TransactionState::Committing)
    }

    /// Mark the transaction Committed and discard its backups
    pub fn finish_commit(mut self) -> Result<()> {
        self.ensure_state(TransactionState::Committing)?;
        self.set_state(TransactionState::Committed)?;
        info!("Committed transaction {} ({} entries)", self.id, self.entries.len());
        self.discard()
    }

    /// Commit without an intermediate manifest write
    pub fn commit(mut self) -> Result<()> {
        self.begin_commit()?;
        self.finish_commit()
    }

    /// Undo every entry in reverse order and mark the transaction RolledBack
    ///
    /// Safe to repeat: each undo step tolerates having already happened. If an
    /// undo fails the journal stays in RollingBack for the next recovery pass.
    pub fn rollback(mut self) -> Result<()> {
        if self.state == TransactionState::Committed {
            return Err(Error::JournalCorruption {
                transaction: self.id.clone(),
                reason: "cannot roll back a committed transaction".to_string(),
            });
        }
        if self.state != TransactionState::RollingBack {
            self.set_state(TransactionState::RollingBack)?;
        }

        warn!(
            "Rolling back transaction {} for {} ({} entries)",
            self.id,
            self.package,
            self.entries.len()
        );

        for entry in self.entries.iter().rev() {
            self.undo(entry)?;
        }

        self.set_state(TransactionState::RolledBack)?;
        info!("Rolled back transaction {}", self.id);
        self.discard()
    }

    /// Remove the transaction directory of a finished transaction
    pub(super) fn discard(self) -> Result<()> {
        debug!("Discarding journal {}", self.dir.display());
        let dir = self.dir.clone();
        drop(self);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::IoError(format!(
                "Failed to remove journal {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    fn undo(&self, entry: &JournalEntry) -> Result<()> {
        debug!(
            "Undo #{} {:?} {:?} {}",
            entry.seq,
            entry.operation,
            entry.kind,
            entry.target.display()
        );

        match (entry.operation, entry.kind) {
            (Operation::Create, EntryKind::File) => match fs::remove_file(&entry.target) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::IoError(format!(
                    "Failed to remove {}: {}",
                    entry.target.display(),
                    e
                ))),
            },
            (Operation::Create, EntryKind::Directory) => {
                let mut children = match fs::read_dir(&entry.target) {
                    Ok(children) => children,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                if children.next().is_some() {
                    warn!(
                        "Leaving {} in place: it contains files not created by this transaction",
                        entry.target.display()
                    );
                    return Ok(());
                }
                fs::remove_dir(&entry.target)?;
                Ok(())
            }
            (Operation::Overwrite | Operation::Delete, EntryKind::File) => {
                let backup = entry.backup.as_ref().ok_or_else(|| Error::JournalCorruption {
                    transaction: self.id.clone(),
                    reason: format!("entry {} has no backup", entry.seq),
                })?;
                let backup = self.dir.join(backup);
                if !backup.is_file() {
                    return Err(Error::JournalCorruption {
                        transaction: self.id.clone(),
                        reason: format!("backup {} is missing", backup.display()),
                    });
                }
                if let Some(parent) = entry.target.parent() {
                    fs::create_dir_all(parent)?;
                }
                copy_synced(&backup, &entry.target)
            }
            (Operation::Overwrite, EntryKind::Directory) => Ok(()),
            (Operation::Delete, EntryKind::Directory) => {
                fs::create_dir_all(&entry.target)?;
                Ok(())
            }
        }
    }

    fn set_state(&mut self, state: TransactionState) -> Result<()> {
        self.writer.append(&Record::State { state })?;
        self.state = state;
        Ok(())
    }

    fn ensure_state(&self, expected: TransactionState) -> Result<()> {
        if self.state != expected {
            return Err(Error::IoError(format!(
                "Transaction {} is {}, expected {}",
                self.id, self.state, expected
            )));
        }
        Ok(())
    }

    /// `target` must lie below the root without passing through a symlink
    fn ensure_within_root(&self, target: &Path) -> Result<()> {
        let escapes = target
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        let relative = match target.strip_prefix(&self.root) {
            Ok(relative) if !escapes && !relative.as_os_str().is_empty() => relative,
            _ => return Err(Error::PathTraversal(target.display().to_string())),
        };

        let mut current = self.root.clone();
        for component in relative.components() {
            current.push(component);
            match current.symlink_metadata() {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(Error::PathTraversal(format!(
                        "{} passes through symlink {}",
                        target.display(),
                        current.display()
                    )));
                }
                Ok(_) => {}
                // Nothing below a missing component exists either
                Err(_) => break,
            }
        }
        Ok(())
    }
}

/// Copy a file and sync the destination before returning
fn copy_synced(source: &Path, dest: &Path) -> Result<()> {
    fs::copy(source, dest).map_err(|e| {
        Error::IoError(format!(
            "Failed to copy {} to {}: {}",
            source.display(),
            dest.display(),
            e
        ))
    })?;
    fs::File::open(dest)
        .and_then(|f| f.sync_all())
        .map_err(|e| Error::IoError(format!("Failed to sync {}: {}", dest.display(), e)))?;
    Ok(())
}

/// Write the header and initial state of a not yet visible transaction
fn stage_header(
    staging: &Path,
    id: &str,
    package: &str,
    root: &Path,
    created_at: &str,
) -> Result<()> {
    fs::create_dir_all(staging.join(BACKUP_DIR)).map_err(|e| {
        Error::IoError(format!("Failed to create {}: {}", staging.display(), e))
    })?;

    let mut writer = JournalWriter::create(&staging.join(JOURNAL_FILE))?;
    writer.append(&Record::Header {
        format: FORMAT_VERSION,
        id: id.to_string(),
        package: package.to_string(),
        root: root.to_path_buf(),
        created_at: created_at.to_string(),
    })?;
    writer.append(&Record::State {
        state: TransactionState::Open,
    })?;
    drop(writer);
    sync_dir(staging)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, Journal) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let journal = Journal::new(temp.path().join("journal"));
        (temp, root, journal)
    }

    #[test]
    fn test_rollback_restores_overwritten_and_removes_created() {
        let (temp, root, journal) = setup();
        let src = temp.path().join("src.txt");
        fs::write(&src, b"new").unwrap();
        fs::write(root.join("existing.txt"), b"old").unwrap();

        let mut tx = journal.open("example", &root).unwrap();
        tx.create_dir_all(&root.join("GameData/Mod")).unwrap();
        assert_eq!(
            tx.write_file(&src, &root.join("GameData/Mod/a.txt")).unwrap(),
            WriteOutcome::Created
        );
        assert_eq!(
            tx.write_file(&src, &root.join("existing.txt")).unwrap(),
            WriteOutcome::Overwritten
        );
        assert_eq!(fs::read(root.join("existing.txt")).unwrap(), b"new");

        tx.rollback().unwrap();

        assert_eq!(fs::read(root.join("existing.txt")).unwrap(), b"old");
        assert!(!root.join("GameData").exists());
        assert!(journal.transaction_ids().unwrap().is_empty());
    }

    #[test]
    fn test_delete_then_rollback_restores_file() {
        let (_temp, root, journal) = setup();
        fs::write(root.join("keep.cfg"), b"settings").unwrap();

        let mut tx = journal.open("example", &root).unwrap();
        tx.delete_file(&root.join("keep.cfg")).unwrap();
        assert!(!root.join("keep.cfg").exists());

        tx.rollback().unwrap();
        assert_eq!(fs::read(root.join("keep.cfg")).unwrap(), b"settings");
    }

    #[test]
    fn test_commit_discards_backups() {
        let (temp, root, journal) = setup();
        let src = temp.path().join("src.txt");
        fs::write(&src, b"data").unwrap();

        let mut tx = journal.open("example", &root).unwrap();
        tx.write_file(&src, &root.join("a.txt")).unwrap();
        tx.commit().unwrap();

        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"data");
        assert!(journal.transaction_ids().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_paths_outside_root() {
        let (temp, root, journal) = setup();
        let src = temp.path().join("src.txt");
        fs::write(&src, b"data").unwrap();

        let mut tx = journal.open("example", &root).unwrap();
        let result = tx.write_file(&src, &temp.path().join("outside.txt"));
        assert!(matches!(result, Err(Error::PathTraversal(_))));
        let result = tx.write_file(&src, &root.join("../outside.txt"));
        assert!(matches!(result, Err(Error::PathTraversal(_))));
        assert!(tx.entries().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_writes_through_symlinked_directory() {
        let (temp, root, journal) = setup();
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("GameData")).unwrap();
        let src = temp.path().join("src");
        fs::write(&src, b"mod").unwrap();

        let mut tx = journal.open("example", &root).unwrap();
        let result = tx.write_file(&src, &root.join("GameData/part.cfg"));
        assert!(matches!(result, Err(Error::PathTraversal(_))));
        assert!(!outside.join("part.cfg").exists());
        assert!(tx.entries().is_empty());
        tx.rollback().unwrap();
    }

    #[test]
    fn test_written_files_tracks_latest_state() {
        let (temp, root, journal) = setup();
        let src = temp.path().join("src.txt");
        fs::write(&src, b"data").unwrap();

        let mut tx = journal.open("example", &root).unwrap();
        tx.write_file(&src, &root.join("a.txt")).unwrap();
        tx.write_file(&src, &root.join("b.txt")).unwrap();
        tx.write_file(&src, &root.join("a.txt")).unwrap();
        tx.delete_file(&root.join("b.txt")).unwrap();

        assert_eq!(tx.written_files(), vec![root.join("a.txt")]);
        // a.txt did not exist before the transaction, so it has no original
        assert!(tx.overwritten_originals().is_empty());
        tx.rollback().unwrap();
        assert!(!root.join("a.txt").exists());
        assert!(!root.join("b.txt").exists());
    }

    #[test]
    fn test_load_round_trips_entries_and_status() {
        let (temp, root, journal) = setup();
        let src = temp.path().join("src.txt");
        fs::write(&src, b"data").unwrap();

        let mut tx = journal.open("example", &root).unwrap();
        tx.write_file(&src, &root.join("a.txt")).unwrap();
        let pending = tx
            .record(Operation::Create, EntryKind::File, &root.join("b.txt"), None)
            .unwrap();
        let id = tx.id().to_string();
        drop(tx);

        let loaded = Transaction::load(&journal.dir().join(&id)).unwrap();
        assert_eq!(loaded.id(), id);
        assert_eq!(loaded.package(), "example");
        assert_eq!(loaded.state(), TransactionState::Open);
        assert_eq!(loaded.entries().len(), 2);
        assert_eq!(loaded.entries()[0].status, EntryStatus::Applied);
        assert_eq!(loaded.entries()[pending].status, EntryStatus::Pending);
    }
}
