// src/config.rs

//! Runtime configuration
//!
//! A `Config` is built once (from a TOML file, defaults, and CLI overrides)
//! and handed to [`crate::Packman`]. Nothing in the library reads environment
//! variables on its own.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Default location of the remote definition repository archive
pub const DEFAULT_GIT_URL: &str = "https://github.com/audoh/packman/archive/refs/heads/main.tar.gz";

/// Default subdirectory of the remote repository holding definitions
pub const DEFAULT_GIT_DEFINITION_PATH: &str = "cfg";

/// Default fetch timeout per HTTP request
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default wait for a package lock held by another process
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;

/// Log verbosity accepted in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            // tracing has no level above error
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Where package definitions are pulled from by `update`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    /// Archive URL (`.tar.gz`/`.zip`) or `file://` directory of the repository
    pub url: String,
    /// Directory inside the repository that holds the definitions
    pub definition_path: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GIT_URL.to_string(),
            definition_path: DEFAULT_GIT_DEFINITION_PATH.to_string(),
        }
    }
}

/// Packman configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Install target (the game directory)
    pub root_path: PathBuf,
    /// SQLite manifest database
    pub manifest_path: PathBuf,
    /// Directory of per-transaction journals, backups, and locks
    pub journal_path: PathBuf,
    /// Snapshot cache
    pub cache_path: PathBuf,
    /// Directory of `<name>.yml` package definitions
    pub definition_path: PathBuf,
    pub git: RemoteConfig,
    pub log_level: LogLevel,
    pub fetch_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub github_api_url: String,
    pub spacedock_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            manifest_path: PathBuf::from("packman/manifest.db"),
            journal_path: PathBuf::from("packman/journal"),
            cache_path: PathBuf::from("packman/cache"),
            definition_path: PathBuf::from("cfg"),
            git: RemoteConfig::default(),
            log_level: LogLevel::default(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            github_api_url: "https://api.github.com".to_string(),
            spacedock_url: "https://spacedock.info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Configuration rooted entirely inside one state directory
    ///
    /// Handy for tests and portable installs: manifest, journal, cache and
    /// definitions all live under `state_dir`.
    pub fn with_state_dir(root_path: impl Into<PathBuf>, state_dir: &Path) -> Self {
        Self {
            root_path: root_path.into(),
            manifest_path: state_dir.join("manifest.db"),
            journal_path: state_dir.join("journal"),
            cache_path: state_dir.join("cache"),
            definition_path: state_dir.join("definitions"),
            ..Self::default()
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            root_path = "/games/ksp"
            manifest_path = "/var/lib/packman/manifest.db"
            log_level = "WARNING"
            fetch_timeout_secs = 5

            [git]
            url = "file:///srv/defs"
            definition_path = "definitions"
            "#,
        )
        .unwrap();

        assert_eq!(config.root_path, PathBuf::from("/games/ksp"));
        assert_eq!(config.log_level, LogLevel::Warning);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(config.git.definition_path, "definitions");
        // Unspecified keys keep their defaults
        assert_eq!(config.journal_path, PathBuf::from("packman/journal"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result = Config::from_toml("roots = \"/x\"");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_log_level_filters() {
        assert_eq!(LogLevel::Warning.as_filter(), "warn");
        assert_eq!(LogLevel::Critical.as_filter(), "error");
        assert_eq!("critical".parse::<LogLevel>().unwrap(), LogLevel::Critical);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
