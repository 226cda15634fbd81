//! Mutable-path pattern matching.

use regex::Regex;

use crate::config::ConfigError;

/// Ordered set of compiled patterns naming paths exempt from protection.
///
/// Patterns are compiled once; the set never changes afterwards.
#[derive(Debug, Clone, Default)]
pub struct MutableFileMatcher {
    patterns: Vec<Regex>,
}

impl MutableFileMatcher {
    /// Compile `patterns`, failing on the first one that is not a valid
    /// regular expression.
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Returns true if any pattern matches `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|r| r.is_match(path))
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns true if no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Source text of each pattern, in order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Regex::as_str)
    }
}
