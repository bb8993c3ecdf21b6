// src/definition/repository.rs

//! Local directory of package definitions
//!
//! Definitions are addressed by name: `<dir>/<name>.yml` (or `.yaml`/`.json`),
//! where a name may contain `/` to reach nested directories.

use super::{check_relative, PackageDefinition};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use walkdir::WalkDir;

const EXTENSIONS: [&str; 3] = ["yml", "yaml", "json"];

/// Directory of package definition files
#[derive(Debug, Clone)]
pub struct DefinitionRepository {
    dir: PathBuf,
}

impl DefinitionRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the definition file for `name`, if one exists
    pub fn path_for(&self, name: &str) -> Result<Option<PathBuf>> {
        if name.is_empty() {
            return Err(Error::DefinitionNotFound(name.to_string()));
        }
        check_relative(name)?;

        Ok(EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", name, ext)))
            .find(|path| path.is_file()))
    }

    /// Load the definition for `name`
    pub fn load(&self, name: &str) -> Result<PackageDefinition> {
        let path = self
            .path_for(name)?
            .ok_or_else(|| Error::DefinitionNotFound(name.to_string()))?;

        debug!("Loading definition {} from {}", name, path.display());
        PackageDefinition::from_path(&path)
    }

    /// Every readable definition, keyed by name
    ///
    /// Files that fail to parse are logged and skipped.
    pub fn list(&self) -> Result<Vec<(String, PackageDefinition)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut definitions = Vec::new();
        for entry in WalkDir::new(&self.dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(name) = self.name_of(entry.path()) else {
                continue;
            };

            match PackageDefinition::from_path(entry.path()) {
                Ok(definition) => definitions.push((name, definition)),
                Err(e) => error!("Failed to read {}: {}", entry.path().display(), e),
            }
        }

        Ok(definitions)
    }

    /// Copy new or changed definition files from `source_dir` into this repository
    ///
    /// Returns whether anything changed.
    pub fn sync_from(&self, source_dir: &Path) -> Result<bool> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::IoError(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;

        let mut updated = false;
        for entry in WalkDir::new(source_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(source_dir)
                .map_err(|e| Error::IoError(e.to_string()))?;
            let dest = self.dir.join(relative);

            let incoming = fs::read(entry.path())?;
            let unchanged = match fs::read(&dest) {
                Ok(existing) => existing == incoming,
                Err(_) => false,
            };
            if unchanged {
                continue;
            }

            info!("Updating {}", dest.display());
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &incoming)?;
            updated = true;
        }

        Ok(updated)
    }

    fn name_of(&self, path: &Path) -> Option<String> {
        let ext = path.extension()?.to_str()?;
        if !EXTENSIONS.contains(&ext) {
            return None;
        }

        let relative = path.strip_prefix(&self.dir).ok()?.with_extension("");
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Some(name)
    }
}
