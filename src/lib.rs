// src/lib.rs

//! Packman
//!
//! Transactional installer for game modifications distributed as loose files.
//!
//! # Architecture
//!
//! - Definitions: declarative YAML naming sources and copy steps
//! - Sources: ordered fallback chain, snapshots cached per version
//! - Journal: every filesystem mutation is recorded and synced before it
//!   happens, so an interrupted operation can always be rolled back
//! - Manifest: SQLite record of installed packages and file fingerprints;
//!   modified files are orphaned on uninstall, never deleted

mod cancel;
pub mod config;
pub mod db;
pub mod definition;
mod error;
pub mod hash;
pub mod journal;
pub mod lock;
pub mod manifest;
mod packman;
pub mod source;
pub mod step;

pub use cancel::CancelToken;
pub use config::Config;
pub use definition::{PackageDefinition, SourceSpec};
pub use error::{Error, FetchError, Result, SourceFailure};
pub use manifest::{ManifestEntry, ManifestFile};
pub use packman::{ImportReport, InstallOptions, Packman, UninstallReport};
