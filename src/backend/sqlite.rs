//! Embedded `SQLite` backend.
//!
//! # Transactions
//!
//! With no isolation level configured the connection stays in autocommit mode
//! and every statement commits on its own. With an isolation level, a
//! transaction is opened in that mode before the first `INSERT`, `UPDATE`,
//! `DELETE`, or `REPLACE` and stays open until `commit` or `rollback`.
//!
//! # Thread Affinity
//!
//! When `check_same_thread` is set the session remembers the thread that
//! created it and rejects calls from any other thread.

use super::{Backend, Session, StatementOutput};
use crate::config::{IsolationLevel, Properties, SessionSettings, SqliteDescriptor};
use crate::value::Value;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::thread::{self, ThreadId};

const NAME: &str = "sqlite";

/// The embedded `SQLite` backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteBackend;

impl Backend for SqliteBackend {
    type Descriptor = SqliteDescriptor;
    type Connection = SqliteSession;

    const NAME: &'static str = NAME;

    fn build_descriptor(&self, props: &Properties) -> Result<SqliteDescriptor> {
        SqliteDescriptor::from_properties(props)
    }

    fn open(&self, descriptor: &SqliteDescriptor) -> Result<SqliteSession> {
        SqliteSession::open(descriptor)
    }

    fn tune(&self, conn: &SqliteSession, descriptor: &SqliteDescriptor) -> Result<()> {
        conn.with_connection(|c| tune(c, &descriptor.session))
    }
}

/// Applies session pragmas to a freshly opened connection.
///
/// # Errors
///
/// Returns [`Error::SessionSetupFailed`] if a pragma is rejected.
pub fn tune(conn: &Connection, settings: &SessionSettings) -> Result<()> {
    if let Some(mode) = settings.journal_mode.as_deref() {
        let applied: String = conn
            .query_row(&format!("PRAGMA journal_mode={mode}"), [], |row| row.get(0))
            .map_err(|e| Error::SessionSetupFailed {
                cause: format!("journal_mode={mode}: {e}"),
            })?;
        tracing::debug!(target: "dbkeeper::sqlite", requested = mode, applied = %applied, "Applied journal mode");
    }

    if let Some(enabled) = settings.foreign_keys {
        let flag = if enabled { "ON" } else { "OFF" };
        conn.execute_batch(&format!("PRAGMA foreign_keys={flag}"))
            .map_err(|e| Error::SessionSetupFailed {
                cause: format!("foreign_keys={flag}: {e}"),
            })?;
        tracing::debug!(target: "dbkeeper::sqlite", foreign_keys = flag, "Applied foreign key enforcement");
    }

    Ok(())
}

/// Returns true if the statement starts with a keyword that opens an implicit transaction.
fn opens_transaction(sql: &str) -> bool {
    let keyword: String = sql
        .trim_start()
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect();
    matches!(
        keyword.to_ascii_uppercase().as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE"
    )
}

fn query_error(operation: &str, e: &rusqlite::Error) -> Error {
    Error::query(operation, e)
}

/// A `SQLite` connection shared through the manager.
pub struct SqliteSession {
    /// `None` once closed.
    ///
    /// Protected by a mutex because `rusqlite::Connection` is not `Sync`.
    conn: Mutex<Option<Connection>>,
    isolation: Option<IsolationLevel>,
    check_same_thread: bool,
    owner: ThreadId,
}

impl SqliteSession {
    /// Opens a connection described by `descriptor` without tuning it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] if `SQLite` cannot open the database.
    pub fn open(descriptor: &SqliteDescriptor) -> Result<Self> {
        let conn = if descriptor.is_memory() {
            Connection::open_in_memory()
        } else {
            Connection::open(&descriptor.path)
        }
        .map_err(|e| Error::ConnectionFailed {
            backend: NAME,
            cause: format!("{}: {e}", descriptor.path.display()),
        })?;

        conn.busy_timeout(descriptor.timeout)
            .map_err(|e| Error::ConnectionFailed {
                backend: NAME,
                cause: format!("busy_timeout: {e}"),
            })?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            isolation: descriptor.isolation,
            check_same_thread: descriptor.check_same_thread,
            owner: thread::current().id(),
        })
    }

    /// Runs `f` with the underlying `rusqlite` connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the session is closed, a thread
    /// affinity error, or whatever `f` returns.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.check_thread()?;
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::ConnectionClosed)?;
        f(conn)
    }

    /// Returns the configured transaction mode.
    #[must_use]
    pub const fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    fn run(conn: &Connection, sql: &str, params: &[Value]) -> Result<StatementOutput> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| query_error("prepare", &e))?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let bound = rusqlite::params_from_iter(params.iter());

        if columns.is_empty() {
            let changed = stmt
                .execute(bound)
                .map_err(|e| query_error("execute", &e))?;
            return Ok(StatementOutput {
                columns,
                rows: Vec::new(),
                rows_affected: Some(changed as u64),
            });
        }

        let width = columns.len();
        let mut rows = stmt.query(bound).map_err(|e| query_error("query", &e))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| query_error("fetch", &e))? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                let cell = row.get_ref(idx).map_err(|e| query_error("fetch", &e))?;
                values.push(Value::from(cell));
            }
            out.push(values);
        }

        Ok(StatementOutput {
            columns,
            rows: out,
            rows_affected: None,
        })
    }
}

impl Session for SqliteSession {
    fn backend_name(&self) -> &'static str {
        NAME
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementOutput> {
        self.with_connection(|conn| {
            if let Some(level) = self.isolation {
                if conn.is_autocommit() && opens_transaction(sql) {
                    conn.execute_batch(level.begin_statement())
                        .map_err(|e| query_error("begin", &e))?;
                }
            }
            Self::run(conn, sql, params)
        })
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(sql)
                .map_err(|e| query_error("execute_batch", &e))
        })
    }

    fn commit(&self) -> Result<()> {
        self.with_connection(|conn| {
            if conn.is_autocommit() {
                return Ok(());
            }
            conn.execute_batch("COMMIT")
                .map_err(|e| query_error("commit", &e))
        })
    }

    fn rollback(&self) -> Result<()> {
        self.with_connection(|conn| {
            if conn.is_autocommit() {
                return Ok(());
            }
            conn.execute_batch("ROLLBACK")
                .map_err(|e| query_error("rollback", &e))
        })
    }

    fn in_transaction(&self) -> bool {
        self.conn
            .lock()
            .as_ref()
            .is_some_and(|conn| !conn.is_autocommit())
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| Error::OperationFailed {
                operation: "sqlite_close".to_string(),
                cause: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    fn check_thread(&self) -> Result<()> {
        if !self.check_same_thread {
            return Ok(());
        }
        let caller = thread::current().id();
        if caller == self.owner {
            return Ok(());
        }
        Err(Error::ThreadAffinity {
            owner: format!("{:?}", self.owner),
            caller: format!("{caller:?}"),
        })
    }
}
