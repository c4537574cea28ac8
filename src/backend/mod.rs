//! Database backends.
//!
//! A [`Backend`] knows how to turn properties into a descriptor, open a
//! physical connection, tune it, and tell whether it is still alive. The
//! [`ConnectionManager`](crate::manager::ConnectionManager) is generic over it,
//! so lifecycle handling is written once for every engine.
//!
//! ```text
//! Backend
//!   ├── build_descriptor(&Properties) → Descriptor
//!   ├── open(&Descriptor)             → Connection
//!   ├── tune(&Connection, &Descriptor)
//!   └── is_alive(&Connection)         → bool
//! ```

mod postgres;
mod sqlite;

pub use postgres::{PostgresBackend, PostgresSession};
pub use sqlite::{SqliteBackend, SqliteSession, tune as tune_sqlite};

use crate::Result;
use crate::config::Properties;
use crate::value::Value;
use std::fmt;

/// Buffered result of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutput {
    /// Result column names, empty for statements that return no rows.
    pub columns: Vec<String>,
    /// Result rows.
    pub rows: Vec<Vec<Value>>,
    /// Rows changed by a DML statement; `None` when the statement returned rows.
    pub rows_affected: Option<u64>,
}

/// A live physical connection with a uniform interface.
///
/// Implementations guard their engine handle internally, so a session can be
/// shared between threads behind an `Arc`.
pub trait Session: Send + Sync {
    /// Returns the backend name.
    fn backend_name(&self) -> &'static str;

    /// Executes one statement and buffers its result.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementOutput>;

    /// Executes a script of statements separated by `;`.
    fn execute_batch(&self, sql: &str) -> Result<()>;

    /// Commits the open transaction. Does nothing when none is open.
    fn commit(&self) -> Result<()>;

    /// Rolls back the open transaction. Does nothing when none is open.
    fn rollback(&self) -> Result<()>;

    /// Returns true if a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Closes the physical connection. Closing twice is not an error.
    fn close(&self) -> Result<()>;

    /// Returns true once the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Fails if the calling thread may not use this connection.
    fn check_thread(&self) -> Result<()> {
        Ok(())
    }
}

/// Engine-specific capabilities used by the connection manager.
pub trait Backend: Send + Sync + 'static {
    /// Validated connection settings.
    type Descriptor: Clone + Send + Sync + fmt::Debug;

    /// Physical connection type.
    type Connection: Session + 'static;

    /// Backend name used in logs and errors.
    const NAME: &'static str;

    /// Builds and validates a descriptor from raw properties.
    fn build_descriptor(&self, props: &Properties) -> Result<Self::Descriptor>;

    /// Opens a physical connection.
    fn open(&self, descriptor: &Self::Descriptor) -> Result<Self::Connection>;

    /// Applies session settings before the connection is published.
    fn tune(&self, _conn: &Self::Connection, _descriptor: &Self::Descriptor) -> Result<()> {
        Ok(())
    }

    /// Returns true if the connection can still be used.
    fn is_alive(&self, conn: &Self::Connection) -> bool {
        !conn.is_closed()
    }
}
