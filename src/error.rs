// src/error.rs

use std::fmt;
use thiserror::Error;

/// Why a single source could not produce a snapshot
///
/// These never abort an install on their own: the fetcher records them and
/// moves on to the next declared source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection refused, DNS failure, timeout, or a 5xx response
    #[error("network error: {0}")]
    Network(String),

    /// The repository, mod, release or file does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested version cannot be pinned to exactly one release
    #[error("cannot resolve version: {0}")]
    AmbiguousVersion(String),

    /// The source kind has no fetch behavior
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The download arrived but could not be unpacked
    #[error("archive error: {0}")]
    Archive(String),
}

/// One failed attempt in a source fallback chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: String,
    pub error: FetchError,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.error)
    }
}

fn join_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Core error types for Packman
#[derive(Error, Debug)]
pub enum Error {
    /// Manifest database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error with path context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Every declared source failed
    #[error("No available sources for {package}: {}", join_failures(.failures))]
    FetchFailed {
        package: String,
        failures: Vec<SourceFailure>,
    },

    /// A copy-folder pattern matched nothing in the snapshot
    #[error("Pattern '{pattern}' matched no directory in the package")]
    NotFound { pattern: String },

    /// A copy-folder pattern matched more than one directory
    #[error("Pattern '{pattern}' is ambiguous, it matched: {}", .matches.join(", "))]
    AmbiguousMatch {
        pattern: String,
        matches: Vec<String>,
    },

    /// A step tried to write outside the install root
    #[error("Path escapes the install root: {0}")]
    PathTraversal(String),

    /// A journal record could not be trusted during recovery
    #[error("Journal for transaction {transaction} is corrupt: {reason}")]
    JournalCorruption { transaction: String, reason: String },

    /// Uninstall or validate for a package that is not in the manifest
    #[error("Package '{0}' is not installed")]
    NotInstalled(String),

    /// Install of a version that is already present
    #[error("Package '{name}' version {version} is already installed")]
    AlreadyInstalled { name: String, version: String },

    /// A step would overwrite a file owned by a different package
    #[error("File {path} is already owned by package '{owner}'")]
    FileConflict { path: String, owner: String },

    /// A reinstall would overwrite a file the user changed since install
    #[error("File {path} of package '{package}' was modified since install; use force to overwrite")]
    ModifiedFile { path: String, package: String },

    /// Every step was skipped or copied nothing
    #[error("Package '{0}' produced no files")]
    NoFiles(String),

    /// Another live process holds the package lock
    #[error("Package '{package}' is locked by process {pid}")]
    Locked { package: String, pid: u32 },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Rollback itself failed; the journal keeps the transaction for recovery
    #[error("{cause} (rollback also failed: {rollback})")]
    RollbackFailed {
        cause: Box<Error>,
        rollback: Box<Error>,
    },

    /// A package definition is malformed
    #[error("Invalid package definition: {0}")]
    InvalidDefinition(String),

    /// No definition file exists for the package name
    #[error("No definition found for package '{0}'")]
    DefinitionNotFound(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Download error for non-source fetches (definition updates)
    #[error("Download error: {0}")]
    DownloadError(String),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether the error came from a step refusing to guess
    pub fn is_step_validation(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::AmbiguousMatch { .. })
    }
}

/// Result type alias using Packman's Error type
pub type Result<T> = std::result::Result<T, Error>;
