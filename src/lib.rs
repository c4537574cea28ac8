//! # dbkeeper
//!
//! A thread-safe, lazily-initialized database connection manager.
//!
//! dbkeeper exposes one cursor/connection interface over two interchangeable
//! backends, an embedded `SQLite` database and a networked PostgreSQL server,
//! configured from a flat `key=value` property file.
//!
//! ## Features
//!
//! - One shared connection per manager, created on first use
//! - Transparent re-creation after `close()` or a dropped server connection
//! - Session tuning (`journal_mode`, `foreign_keys`) for `SQLite`
//! - Autocommit or explicit-transaction mode from configuration
//! - Rows addressable by position and, on request, by column name
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbkeeper::manager::global;
//!
//! let db = global::embedded("resources/db.properties");
//! let mut cur = db.cursor(true)?;
//! cur.execute("SELECT datetime('now') AS server_time", &[])?;
//! if let Some(row) = cur.fetch_one()? {
//!     println!("{:?}", row.get_by_name("server_time"));
//! }
//! cur.close();
//! db.close()?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod backend;
pub mod config;
pub mod cursor;
pub mod manager;
pub mod observability;
pub mod value;

// Re-exports for convenience
pub use backend::{Backend, PostgresBackend, Session, SqliteBackend, StatementOutput};
pub use config::{
    ConnectionDescriptor, IsolationLevel, PostgresDescriptor, Properties, SessionSettings,
    SqliteDescriptor,
};
pub use cursor::{Cursor, Row};
pub use manager::{ConnectionHandle, ConnectionManager};
pub use value::Value;

/// Error type for dbkeeper operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `ConfigNotFound` | The property file does not exist |
/// | `ConfigInvalid` | Required keys are missing or values are malformed |
/// | `StorageUnavailable` | The database directory cannot be created |
/// | `ConnectionFailed` | The engine refused to open a connection |
/// | `SessionSetupFailed` | Post-connect pragmas failed |
/// | `QueryFailed` | A statement, commit, or rollback failed |
/// | `ConnectionClosed` | A cursor or handle outlived its connection |
/// | `CursorClosed` | A closed cursor was used |
/// | `ThreadAffinity` | A same-thread connection was used from another thread |
/// | `FeatureNotEnabled` | The networked backend was used without the `postgres` feature |
/// | `OperationFailed` | I/O or runtime setup failed |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The property file does not exist.
    #[error("configuration file not found: {path}")]
    ConfigNotFound {
        /// Path that was looked up.
        path: String,
    },

    /// One or more configuration keys are missing or malformed.
    ///
    /// Every offending key is reported in a single error.
    #[error("invalid configuration ({}): {reason}", keys.join(", "))]
    ConfigInvalid {
        /// The offending keys.
        keys: Vec<String>,
        /// What is wrong with them.
        reason: String,
    },

    /// The database directory could not be created or accessed.
    #[error("storage unavailable at '{path}': {cause}")]
    StorageUnavailable {
        /// Directory that could not be prepared.
        path: String,
        /// The underlying cause.
        cause: String,
    },

    /// The database engine refused the connection.
    #[error("{backend} connection failed: {cause}")]
    ConnectionFailed {
        /// Backend name.
        backend: &'static str,
        /// The underlying cause.
        cause: String,
    },

    /// Session tuning failed right after connecting.
    ///
    /// The connection is discarded; calling again retries from scratch.
    #[error("session setup failed: {cause}")]
    SessionSetupFailed {
        /// The underlying cause.
        cause: String,
    },

    /// A statement, commit, or rollback failed.
    #[error("query '{operation}' failed: {cause}")]
    QueryFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The connection behind a cursor or handle has been closed.
    #[error("cannot operate on a closed connection")]
    ConnectionClosed,

    /// The cursor has been closed.
    #[error("cannot operate on a closed cursor")]
    CursorClosed,

    /// A connection restricted to its creating thread was used elsewhere.
    #[error("connection created in thread {owner} cannot be used from thread {caller}")]
    ThreadAffinity {
        /// Thread that created the connection.
        owner: String,
        /// Thread that attempted to use it.
        caller: String,
    },

    /// Feature not enabled (requires feature flag).
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Builds a `ConfigInvalid` error for a single key.
    pub fn invalid_key(key: &str, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            keys: vec![key.to_string()],
            reason: reason.into(),
        }
    }

    /// Builds a `QueryFailed` error from any displayable cause.
    pub fn query(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::QueryFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for dbkeeper operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ConfigNotFound {
            path: "missing.properties".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "configuration file not found: missing.properties"
        );

        let err = Error::ConfigInvalid {
            keys: vec!["db.host".to_string(), "db.user".to_string()],
            reason: "missing required property".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid configuration (db.host, db.user): missing required property"
        );

        let err = Error::query("commit", "disk I/O error");
        assert_eq!(err.to_string(), "query 'commit' failed: disk I/O error");
    }
}
