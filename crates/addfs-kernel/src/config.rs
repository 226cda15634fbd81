//! Mount configuration.
//!
//! `AddFsConfig` is built once, before mounting, from an optional TOML file
//! and the command line. It is never mutated while a filesystem is mounted.
//!
//! ```toml
//! source_path = "/srv/archive"
//! allow_root_mutation = true
//! mutable_patterns = ["^/log/.*", "\\.lock$"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors building a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A mutable-path pattern is not a valid regular expression.
    #[error("invalid mutable path pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for one addfs mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AddFsConfig {
    /// Directory tree being protected.
    pub source_path: PathBuf,

    /// Let uid 0 bypass all protection.
    pub allow_root_mutation: bool,

    /// Regular expressions for paths exempt from protection. Patterns are
    /// matched against mount-rooted paths such as `/log/today.txt`.
    pub mutable_patterns: Vec<String>,

    /// Skip the source directory ownership checks at startup.
    pub ignore_ownership_warnings: bool,

    /// Leave the filesystem mounted when the process is interrupted.
    pub keep_mounted: bool,
}

impl AddFsConfig {
    /// Create a configuration protecting `source_path` with no exceptions.
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            ..Default::default()
        }
    }

    /// Allow or disallow the root bypass.
    pub fn with_allow_root_mutation(mut self, allow: bool) -> Self {
        self.allow_root_mutation = allow;
        self
    }

    /// Add a mutable path pattern.
    pub fn with_mutable_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.mutable_patterns.push(pattern.into());
        self
    }

    /// Add several mutable path patterns.
    pub fn with_mutable_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mutable_patterns
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Skip the startup ownership checks.
    pub fn with_ignore_ownership_warnings(mut self, ignore: bool) -> Self {
        self.ignore_ownership_warnings = ignore;
        self
    }

    /// Keep the filesystem mounted on interrupt.
    pub fn with_keep_mounted(mut self, keep: bool) -> Self {
        self.keep_mounted = keep;
        self
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Layer `other` (usually the command line) over this configuration.
    ///
    /// A non-empty source path in `other` wins, booleans OR together, and
    /// patterns are appended after the existing ones.
    pub fn merge(mut self, other: AddFsConfig) -> Self {
        if !other.source_path.as_os_str().is_empty() {
            self.source_path = other.source_path;
        }
        self.allow_root_mutation |= other.allow_root_mutation;
        self.ignore_ownership_warnings |= other.ignore_ownership_warnings;
        self.keep_mounted |= other.keep_mounted;
        self.mutable_patterns.extend(other.mutable_patterns);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_protect_everything() {
        let config = AddFsConfig::new("/srv/data");
        assert_eq!(config.source_path, PathBuf::from("/srv/data"));
        assert!(!config.allow_root_mutation);
        assert!(config.mutable_patterns.is_empty());
        assert!(!config.ignore_ownership_warnings);
        assert!(!config.keep_mounted);
    }

    #[test]
    fn test_builders() {
        let config = AddFsConfig::new("/srv/data")
            .with_allow_root_mutation(true)
            .with_mutable_pattern("^/log/.*")
            .with_mutable_patterns(["\\.tmp$", "^/cache/"])
            .with_keep_mounted(true);

        assert!(config.allow_root_mutation);
        assert!(config.keep_mounted);
        assert_eq!(
            config.mutable_patterns,
            vec!["^/log/.*", "\\.tmp$", "^/cache/"]
        );
    }

    #[test]
    fn test_from_toml() {
        let config = AddFsConfig::from_toml_str(
            r#"
            source_path = "/srv/archive"
            allow_root_mutation = true
            mutable_patterns = ["^/log/.*"]
            "#,
        )
        .unwrap();

        assert_eq!(config.source_path, PathBuf::from("/srv/archive"));
        assert!(config.allow_root_mutation);
        assert_eq!(config.mutable_patterns, vec!["^/log/.*"]);
        assert!(!config.keep_mounted);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = AddFsConfig::from_toml_str("allow_everything = true");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = AddFsConfig::load("/nonexistent/addfs.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("addfs.toml");
        std::fs::write(&path, "keep_mounted = true\n").unwrap();

        let config = AddFsConfig::load(&path).unwrap();
        assert!(config.keep_mounted);
    }

    #[test]
    fn test_merge_cli_over_file() {
        let file = AddFsConfig::new("/from/file")
            .with_mutable_pattern("^/log/")
            .with_allow_root_mutation(true);
        let cli = AddFsConfig::new("/from/cli").with_mutable_pattern("\\.tmp$");

        let merged = file.merge(cli);
        assert_eq!(merged.source_path, PathBuf::from("/from/cli"));
        assert!(merged.allow_root_mutation);
        assert_eq!(merged.mutable_patterns, vec!["^/log/", "\\.tmp$"]);
    }

    #[test]
    fn test_merge_keeps_file_source_when_cli_empty() {
        let file = AddFsConfig::new("/from/file");
        let merged = file.merge(AddFsConfig::default().with_keep_mounted(true));
        assert_eq!(merged.source_path, PathBuf::from("/from/file"));
        assert!(merged.keep_mounted);
    }
}
