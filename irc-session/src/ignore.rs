//! Per-connection ignore list.

use regex::{Regex, RegexBuilder};

use crate::error::ConfigError;

/// Case-insensitive regular expressions matched against `nick!ident@host`.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    patterns: Vec<Regex>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::new();
        for pattern in patterns {
            list.add(pattern.as_ref())?;
        }
        Ok(list)
    }

    pub fn add(&mut self, pattern: &str) -> Result<(), ConfigError> {
        let regex = RegexBuilder::new(&format!("^(?:{pattern})$"))
            .case_insensitive(true)
            .build()
            .map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        self.patterns.push(regex);
        Ok(())
    }

    pub fn remove(&mut self, pattern: &str) -> bool {
        let anchored = format!("^(?:{pattern})$");
        let before = self.patterns.len();
        self.patterns.retain(|r| r.as_str() != anchored);
        self.patterns.len() != before
    }

    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|r| r.is_match(host))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}
