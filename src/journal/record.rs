// src/journal/record.rs

//! On-disk journal format
//!
//! Each transaction owns one append-only JSON-lines file. Every line is one
//! [`Record`]; the first line is always the header. A line is only complete
//! once its trailing newline is on disk, so a final line without one is an
//! interrupted append and carries no information.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Journal file name inside a transaction directory
pub const JOURNAL_FILE: &str = "journal.jsonl";

/// Current record format version
pub const FORMAT_VERSION: u32 = 1;

/// What a journal entry does to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Overwrite,
    Delete,
}

/// Whether a journal entry targets a file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionState::Open => "open",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::RollingBack => "rolling_back",
            TransactionState::RolledBack => "rolled_back",
        }
    }

    /// Committed and RolledBack transactions need no further work
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack
        )
    }
}

impl FromStr for TransactionState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(TransactionState::Open),
            "committing" => Ok(TransactionState::Committing),
            "committed" => Ok(TransactionState::Committed),
            "rolling_back" => Ok(TransactionState::RollingBack),
            "rolled_back" => Ok(TransactionState::RolledBack),
            _ => Err(format!("Invalid transaction state: {}", s)),
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Header {
        format: u32,
        id: String,
        package: String,
        root: PathBuf,
        created_at: String,
    },
    Entry {
        seq: usize,
        operation: Operation,
        kind: EntryKind,
        target: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backup: Option<PathBuf>,
    },
    Applied {
        seq: usize,
    },
    State {
        state: TransactionState,
    },
}

/// Append handle on a journal file; every append is synced before returning
#[derive(Debug)]
pub struct JournalWriter {
    path: PathBuf,
    file: File,
    /// Length to truncate to before the next append
    truncate_to: Option<u64>,
}

impl JournalWriter {
    /// Create a new journal file; fails if one already exists
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                Error::IoError(format!("Failed to create journal {}: {}", path.display(), e))
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            truncate_to: None,
        })
    }

    /// Reopen an existing journal for appending
    ///
    /// An interrupted trailing line is cut off before the first append so the
    /// next record starts on a fresh line. Nothing is written until then, so a
    /// journal can be inspected while its owner is still running.
    pub fn reopen(path: &Path, valid_len: u64) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path).map_err(|e| {
            Error::IoError(format!("Failed to open journal {}: {}", path.display(), e))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            truncate_to: Some(valid_len),
        })
    }

    /// Append one record and flush it to durable storage
    pub fn append(&mut self, record: &Record) -> Result<()> {
        if let Some(len) = self.truncate_to.take() {
            if self.file.metadata()?.len() != len {
                self.file.set_len(len)?;
                self.file.sync_all()?;
            }
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        self.file.write_all(&line).map_err(|e| {
            Error::IoError(format!("Failed to append to {}: {}", self.path.display(), e))
        })?;
        self.file.sync_all().map_err(|e| {
            Error::IoError(format!("Failed to sync {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}

/// Parsed journal contents
#[derive(Debug)]
pub struct JournalContents {
    pub records: Vec<Record>,
    /// Byte length of the complete lines
    pub valid_len: u64,
}

/// Read every complete record of a journal file
///
/// `transaction` names the transaction in corruption errors.
pub fn read_records(path: &Path, transaction: &str) -> Result<JournalContents> {
    let corrupt = |reason: String| Error::JournalCorruption {
        transaction: transaction.to_string(),
        reason,
    };

    let raw = std::fs::read(path).map_err(|e| corrupt(format!("unreadable journal: {}", e)))?;

    let complete_len = match raw.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    if complete_len < raw.len() {
        warn!(
            "Ignoring interrupted journal append in {} ({} bytes)",
            path.display(),
            raw.len() - complete_len
        );
    }

    let text = std::str::from_utf8(&raw[..complete_len])
        .map_err(|e| corrupt(format!("journal is not valid UTF-8: {}", e)))?;

    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let record: Record = serde_json::from_str(line)
            .map_err(|e| corrupt(format!("line {}: {}", line_no + 1, e)))?;
        records.push(record);
    }

    Ok(JournalContents {
        records,
        valid_len: complete_len as u64,
    })
}

/// Flush directory metadata so newly created entries survive a crash
pub fn sync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(path)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| Error::IoError(format!("Failed to sync {}: {}", path.display(), e)))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
