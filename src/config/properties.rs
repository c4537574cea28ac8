//! Flat `key=value` property files.

use crate::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Values that coerce to `true`, compared after trimming and lowercasing.
const TRUTHY: &[&str] = &["1", "true", "yes", "y", "on"];

/// Parsed contents of a property file.
///
/// Keys and values are trimmed. Duplicate keys keep the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: HashMap<String, String>,
}

impl Properties {
    /// Creates an empty property set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads properties from a file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigNotFound`] if the path does not exist, or
    /// [`Error::OperationFailed`] if it cannot be read as UTF-8.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_properties".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;

        let props = Self::parse(&contents);
        tracing::debug!(
            target: "dbkeeper::config",
            path = %path.display(),
            keys = props.len(),
            "Loaded properties"
        );
        Ok(props)
    }

    /// Parses property text.
    ///
    /// Blank lines, lines starting with `#` or `;`, and lines without `=` are skipped.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let mut entries = HashMap::new();
        for raw in contents.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self { entries }
    }

    /// Returns the value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns the value for a key, treating an empty value as absent.
    #[must_use]
    pub fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Returns the value for a key coerced to a boolean.
    ///
    /// An empty value counts as absent and yields `default`.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        parse_bool(self.get_nonempty(key), default)
    }

    /// Sets a value, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the underlying mapping.
    #[must_use]
    pub const fn as_map(&self) -> &HashMap<String, String> {
        &self.entries
    }
}

impl FromStr for Properties {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Coerces an optional property value to a boolean.
///
/// Absent values yield `default`. Present values are true only when they are
/// one of `1`, `true`, `yes`, `y`, `on` (case-insensitive, trimmed).
#[must_use]
pub fn parse_bool(value: Option<&str>, default: bool) -> bool {
    value.map_or(default, |v| {
        let v = v.trim().to_lowercase();
        TRUTHY.contains(&v.as_str())
    })
}
