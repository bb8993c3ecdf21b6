// src/step/mod.rs

//! Step execution
//!
//! A step turns part of a fetched snapshot into journaled mutations of the
//! install root. Resolution happens before the first mutation, so a step that
//! fails validation (no match, ambiguous match) leaves nothing to undo.

pub mod condition;

pub use condition::{all_satisfied, Condition, ConditionContext};

use crate::cancel::CancelToken;
use crate::definition::{check_relative, CopyFolder, InstallStep};
use crate::error::{Error, Result};
use crate::journal::Transaction;
use globset::{Glob, GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Everything a step reads while executing
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub snapshot: &'a Path,
    pub root: &'a Path,
    pub cancel: &'a CancelToken,
}

impl StepContext<'_> {
    fn conditions(&self) -> ConditionContext<'_> {
        ConditionContext {
            snapshot: self.snapshot,
            root: self.root,
        }
    }
}

/// Result of running one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Conditions did not hold; nothing was journaled
    Skipped,
    /// Absolute paths of the files written, in write order
    Applied(Vec<PathBuf>),
}

/// A file or directory the step will materialize
#[derive(Debug, Clone, PartialEq, Eq)]
enum PlannedItem {
    Directory(PathBuf),
    File { source: PathBuf, target: PathBuf },
}

impl InstallStep {
    /// Run the step against the root, journaling every mutation in `tx`
    ///
    /// `vet` sees each file target before it is written and may refuse it.
    pub fn execute(
        &self,
        context: &StepContext<'_>,
        tx: &mut Transaction,
        vet: &mut dyn FnMut(&Path) -> Result<()>,
    ) -> Result<StepOutcome> {
        if !all_satisfied(self.conditions(), &context.conditions()) {
            debug!("Skipping {}: conditions not satisfied", self.describe());
            return Ok(StepOutcome::Skipped);
        }

        match self {
            InstallStep::CopyFolder(step) => step.execute(context, tx, vet),
        }
    }
}

impl CopyFolder {
    /// Find the single snapshot directory the pattern names
    ///
    /// Returns the path relative to the snapshot, `/`-separated.
    pub fn resolve(&self, snapshot: &Path) -> Result<String> {
        let pattern = normalize_pattern(&self.pattern);
        let matcher = folder_matcher(pattern)?;

        let mut matches = Vec::new();
        for entry in WalkDir::new(snapshot).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let relative = relative_slash(entry.path(), snapshot)?;
            if matcher.is_match(&relative) {
                matches.push(relative);
            }
        }

        match matches.len() {
            0 => Err(Error::NotFound {
                pattern: self.pattern.clone(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::AmbiguousMatch {
                pattern: self.pattern.clone(),
                matches,
            }),
        }
    }

    fn plan(&self, snapshot: &Path, root: &Path) -> Result<Vec<PlannedItem>> {
        check_relative(&self.to)?;

        let folder = snapshot.join(self.resolve(snapshot)?);
        let destination = root.join(&self.to);
        let excluded = exclusion_set(&self.exclude)?;

        let mut items = vec![PlannedItem::Directory(destination.clone())];
        let walker = WalkDir::new(&folder)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                match entry.path().strip_prefix(&folder) {
                    Ok(relative) => !excluded.is_match(relative),
                    Err(_) => true,
                }
            });

        for entry in walker {
            let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(&folder)
                .map_err(|e| Error::IoError(e.to_string()))?;
            let target = destination.join(relative);

            // file_type() does not follow links, so a snapshot symlink is never copied
            if entry.file_type().is_dir() {
                items.push(PlannedItem::Directory(target));
            } else if entry.file_type().is_file() {
                items.push(PlannedItem::File {
                    source: entry.path().to_path_buf(),
                    target,
                });
            } else if entry.path_is_symlink() {
                warn!("Skipping symlink {}", entry.path().display());
            } else {
                debug!("Ignoring special file {}", entry.path().display());
            }
        }

        Ok(items)
    }

    fn execute(
        &self,
        context: &StepContext<'_>,
        tx: &mut Transaction,
        vet: &mut dyn FnMut(&Path) -> Result<()>,
    ) -> Result<StepOutcome> {
        let plan = self.plan(context.snapshot, context.root)?;
        info!(
            "copy-folder {} -> {} ({} entries)",
            self.pattern,
            if self.to.is_empty() { "." } else { self.to.as_str() },
            plan.len()
        );

        let mut written = Vec::new();
        for item in plan {
            context.cancel.check()?;
            match item {
                PlannedItem::Directory(dir) => {
                    if dir != context.root {
                        tx.create_dir_all(&dir)?;
                    }
                }
                PlannedItem::File { source, target } => {
                    vet(&target)?;
                    tx.write_file(&source, &target)?;
                    written.push(target);
                }
            }
        }

        Ok(StepOutcome::Applied(written))
    }
}

fn normalize_pattern(pattern: &str) -> &str {
    let pattern = pattern.trim_end_matches('/');
    pattern.strip_prefix("./").unwrap_or(pattern)
}

/// `*` stays within one path component; `**` crosses them
fn folder_matcher(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| Error::InvalidDefinition(format!("invalid glob '{}': {}", pattern, e)))
}

fn exclusion_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(normalize_pattern(pattern)).map_err(|e| {
            Error::InvalidDefinition(format!("invalid glob '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::InvalidDefinition(e.to_string()))
}

/// `path` relative to `base`, joined with `/` on every platform
pub(crate) fn relative_slash(path: &Path, base: &Path) -> Result<String> {
    let relative = path.strip_prefix(base).map_err(|_| {
        Error::PathTraversal(format!(
            "{} is not inside {}",
            path.display(),
            base.display()
        ))
    })?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}
