//! Configuration management.
//!
//! Connection settings live in a flat property file:
//!
//! ```text
//! # embedded backend
//! db.path = data/app.db
//! db.timeout = 5
//! db.isolation_level =
//! db.journal_mode = WAL
//! db.foreign_keys = on
//! ```

mod descriptor;
mod properties;

pub use descriptor::{
    ConnectionDescriptor, DEFAULT_PORT, DEFAULT_TIMEOUT_SECS, IsolationLevel, MAX_TIMEOUT_MILLIS,
    MEMORY_PATH, PostgresDescriptor, SessionSettings, SqliteDescriptor, SslMode, keys,
};
pub use properties::{Properties, parse_bool};

use std::path::{Path, PathBuf};

/// Environment variable naming the property file.
pub const PROPERTIES_ENV: &str = "DBKEEPER_PROPERTIES";

/// Property file used when neither a path nor [`PROPERTIES_ENV`] is given.
pub const DEFAULT_PROPERTIES_PATH: &str = "resources/db.properties";

/// Resolves the property file location.
///
/// Checks the following in order:
/// 1. The explicit path, if any
/// 2. The `DBKEEPER_PROPERTIES` environment variable
/// 3. [`DEFAULT_PROPERTIES_PATH`]
#[must_use]
pub fn resolve_properties_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    std::env::var_os(PROPERTIES_ENV)
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_PROPERTIES_PATH), PathBuf::from)
}
