// src/definition/mod.rs

//! Package definitions
//!
//! A definition names an ordered fallback chain of sources and an ordered list
//! of steps that materialize the fetched snapshot into the install root:
//!
//! ```yaml
//! name: Kerbal Engineer Redux
//! description: Flight data readouts
//! sources:
//!   - github: jrbudda/KerbalEngineer
//!   - spacedock: 1234
//! steps:
//!   - copy-folder: "GameData/KerbalEngineer"
//!     to: GameData/KerbalEngineer
//!     without: ["*.pdb"]
//! ```

pub mod repository;

use crate::error::{Error, Result};
use crate::step::Condition;
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

pub use repository::DefinitionRepository;

/// Declarative description of one installable modification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    // `- github: owner/repo` map form rather than YAML `!github` tags
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub sources: Vec<SourceSpec>,
    pub steps: Vec<InstallStep>,
}

/// Where a package can be fetched from
///
/// Sources are tried strictly in declaration order; the first one that yields
/// a snapshot wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceSpec {
    /// GitHub releases of `owner/repo`
    #[serde(rename = "github")]
    GitHub(String),
    /// A SpaceDock mod id
    #[serde(rename = "spacedock")]
    SpaceDock(u64),
    /// A direct download (`https://`, `http://`) or a local `file://` path
    #[serde(rename = "url")]
    Url(String),
    /// Reserved placeholder kind with no fetch behavior
    #[serde(rename = "wuppertal")]
    Abstract(bool),
}

impl SourceSpec {
    /// Short human-readable label used in logs and aggregate errors
    pub fn label(&self) -> String {
        match self {
            SourceSpec::GitHub(repo) => format!("github:{}", repo),
            SourceSpec::SpaceDock(id) => format!("spacedock:{}", id),
            SourceSpec::Url(url) => format!("url:{}", url),
            SourceSpec::Abstract(flag) => format!("wuppertal:{}", flag),
        }
    }

    /// Whether this kind of source can report release versions
    pub fn is_versioned(&self) -> bool {
        matches!(self, SourceSpec::GitHub(_) | SourceSpec::SpaceDock(_))
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// One declarative materialization step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstallStep {
    CopyFolder(CopyFolder),
}

/// Copy exactly one directory of the snapshot into the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyFolder {
    /// Glob resolved against the snapshot; must match exactly one directory
    #[serde(rename = "copy-folder")]
    pub pattern: String,
    /// Destination relative to the install root
    pub to: String,
    /// Globs (relative to the matched folder) that are never copied
    #[serde(default, rename = "without", skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default, rename = "if", skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl InstallStep {
    pub fn conditions(&self) -> &[Condition] {
        match self {
            InstallStep::CopyFolder(step) => &step.conditions,
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            InstallStep::CopyFolder(step) => {
                format!("copy-folder {} -> {}", step.pattern, step.to)
            }
        }
    }
}

impl PackageDefinition {
    /// Parse a YAML definition
    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(content)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse a JSON definition
    pub fn from_json(content: &str) -> Result<Self> {
        let definition: Self = serde_json::from_str(content)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Load a definition file, choosing the parser by extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::IoError(format!("Failed to read definition {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Check the structural invariants the schema promises
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidDefinition("name must not be empty".to_string()));
        }
        if self.sources.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "{}: at least one source is required",
                self.name
            )));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "{}: at least one step is required",
                self.name
            )));
        }

        for step in &self.steps {
            match step {
                InstallStep::CopyFolder(copy) => {
                    if copy.pattern.trim().is_empty() {
                        return Err(Error::InvalidDefinition(format!(
                            "{}: copy-folder pattern must not be empty",
                            self.name
                        )));
                    }
                    for pattern in std::iter::once(&copy.pattern).chain(copy.exclude.iter()) {
                        Glob::new(pattern).map_err(|e| {
                            Error::InvalidDefinition(format!(
                                "{}: invalid glob '{}': {}",
                                self.name, pattern, e
                            ))
                        })?;
                    }
                    check_relative(&copy.to)?;
                }
            }
        }

        Ok(())
    }
}

/// Reject absolute paths and parent-directory components
pub(crate) fn check_relative(path: &str) -> Result<()> {
    let candidate = Path::new(path);
    let escapes = candidate.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });

    if escapes {
        return Err(Error::PathTraversal(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"
name: Kerbal Engineer Redux
description: Flight data readouts
sources:
  - github: jrbudda/KerbalEngineer
  - spacedock: 1234
  - url: https://example.com/ker.zip
  - wuppertal: true
steps:
  - copy-folder: "GameData/KerbalEngineer"
    to: GameData
    without: ["*.pdb", "Docs"]
  - copy-folder: "Extras"
    to: "GameData/KerbalEngineer/Extras"
    if: []
"#;

    #[test]
    fn test_parse_yaml_definition() {
        let def = PackageDefinition::from_yaml(DEFINITION).unwrap();

        assert_eq!(def.name, "Kerbal Engineer Redux");
        assert_eq!(
            def.sources,
            vec![
                SourceSpec::GitHub("jrbudda/KerbalEngineer".to_string()),
                SourceSpec::SpaceDock(1234),
                SourceSpec::Url("https://example.com/ker.zip".to_string()),
                SourceSpec::Abstract(true),
            ]
        );
        assert_eq!(def.steps.len(), 2);

        let InstallStep::CopyFolder(first) = &def.steps[0];
        assert_eq!(first.pattern, "GameData/KerbalEngineer");
        assert_eq!(first.exclude, vec!["*.pdb", "Docs"]);
        assert!(first.conditions.is_empty());
    }

    #[test]
    fn test_parse_json_definition() {
        let def = PackageDefinition::from_json(
            r#"{
                "name": "Example",
                "sources": [{"url": "file:///tmp/example"}],
                "steps": [{"copy-folder": "Example", "to": "GameData"}]
            }"#,
        )
        .unwrap();

        assert_eq!(def.description, None);
        assert_eq!(def.sources[0].label(), "url:file:///tmp/example");
    }

    #[test]
    fn test_reject_empty_sources() {
        let result = PackageDefinition::from_yaml(
            "name: x\nsources: []\nsteps:\n  - copy-folder: a\n    to: b\n",
        );
        assert!(matches!(result, Err(Error::InvalidDefinition(_))));
    }

    #[test]
    fn test_reject_empty_steps() {
        let result =
            PackageDefinition::from_yaml("name: x\nsources:\n  - url: file:///a\nsteps: []\n");
        assert!(matches!(result, Err(Error::InvalidDefinition(_))));
    }

    #[test]
    fn test_reject_unknown_step_field() {
        let result = PackageDefinition::from_yaml(
            "name: x\nsources:\n  - url: file:///a\nsteps:\n  - copy-folder: a\n    to: b\n    into: c\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_reject_unknown_source_kind() {
        let result = PackageDefinition::from_yaml(
            "name: x\nsources:\n  - ftp: example.com\nsteps:\n  - copy-folder: a\n    to: b\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_reject_escaping_destination() {
        let result = PackageDefinition::from_yaml(
            "name: x\nsources:\n  - url: file:///a\nsteps:\n  - copy-folder: a\n    to: ../outside\n",
        );
        assert!(matches!(result, Err(Error::PathTraversal(_))));
    }

    #[test]
    fn test_check_relative() {
        assert!(check_relative("GameData/Mod").is_ok());
        assert!(check_relative("").is_ok());
        assert!(check_relative("/etc").is_err());
        assert!(check_relative("a/../../b").is_err());
    }
}
