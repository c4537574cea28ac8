//! Cursors and fetched rows.
//!
//! A [`Cursor`] is a caller-owned view onto the manager's shared connection.
//! It holds only a weak reference, so it never keeps a connection alive after
//! the manager closes it. Results are buffered when a statement executes and
//! handed out by the `fetch_*` methods.

use crate::backend::Session;
use crate::value::Value;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::ops::Index;
use std::sync::{Arc, Weak};

/// A fetched row.
///
/// Values are always addressable by position. Rows fetched through a cursor
/// opened with `as_mapping = true` also carry the column names and can be
/// addressed by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Option<Arc<[String]>>,
    values: Vec<Value>,
}

impl Row {
    /// Returns the value at `idx`.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Returns the value of the named column.
    ///
    /// Exact matches win; otherwise the first case-insensitive match is used.
    /// Always `None` for rows fetched without column names.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let columns = self.columns.as_deref()?;
        let idx = columns
            .iter()
            .position(|c| c == name)
            .or_else(|| columns.iter().position(|c| c.eq_ignore_ascii_case(name)))?;
        self.values.get(idx)
    }

    /// Returns the column names, if this row is name-addressable.
    #[must_use]
    pub fn keys(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    /// Returns the values in column order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the row, returning its values.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over `(column, value)` pairs of a name-addressable row.
    pub fn iter_named(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        &self.values[idx]
    }
}

/// A cursor over the shared connection.
///
/// Callers must [`close`](Self::close) cursors explicitly; the manager does not
/// track them.
pub struct Cursor {
    conn: Weak<dyn Session>,
    as_mapping: bool,
    columns: Arc<[String]>,
    pending: VecDeque<Vec<Value>>,
    row_count: Option<u64>,
    closed: bool,
}

impl Cursor {
    pub(crate) fn new(conn: Weak<dyn Session>, as_mapping: bool) -> Self {
        Self {
            conn,
            as_mapping,
            columns: Arc::from(Vec::new()),
            pending: VecDeque::new(),
            row_count: None,
            closed: false,
        }
    }

    fn connection(&self) -> Result<Arc<dyn Session>> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        self.conn
            .upgrade()
            .filter(|conn| !conn.is_closed())
            .ok_or(Error::ConnectionClosed)
    }

    /// Executes a statement with positional parameters.
    ///
    /// Any rows left over from a previous statement are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CursorClosed`], [`Error::ConnectionClosed`], or the
    /// backend's statement error.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        let conn = self.connection()?;
        self.pending.clear();
        let output = conn.execute(sql, params)?;
        self.columns = Arc::from(output.columns);
        self.pending = output.rows.into();
        self.row_count = output.rows_affected;
        Ok(())
    }

    /// Executes a script of statements. No rows are produced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CursorClosed`], [`Error::ConnectionClosed`], or the
    /// backend's statement error.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        let conn = self.connection()?;
        self.pending.clear();
        self.columns = Arc::from(Vec::new());
        self.row_count = None;
        conn.execute_batch(sql)
    }

    fn make_row(&self, values: Vec<Value>) -> Row {
        Row {
            columns: self.as_mapping.then(|| Arc::clone(&self.columns)),
            values,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        Ok(())
    }

    /// Returns the next row, or `None` when the result is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CursorClosed`] if the cursor is closed.
    pub fn fetch_one(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        Ok(self.pending.pop_front().map(|values| self.make_row(values)))
    }

    /// Returns up to `n` rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CursorClosed`] if the cursor is closed.
    pub fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let take = n.min(self.pending.len());
        let batch: Vec<Vec<Value>> = self.pending.drain(..take).collect();
        Ok(batch.into_iter().map(|v| self.make_row(v)).collect())
    }

    /// Returns all remaining rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CursorClosed`] if the cursor is closed.
    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let remaining = self.pending.len();
        self.fetch_many(remaining)
    }

    /// Rows changed by the last DML statement; `None` after a query.
    #[must_use]
    pub const fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    /// Column names of the last result.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns true if rows are name-addressable.
    #[must_use]
    pub const fn is_mapping(&self) -> bool {
        self.as_mapping
    }

    /// Closes the cursor and drops buffered rows. Closing twice is fine.
    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }

    /// Returns true once closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("as_mapping", &self.as_mapping)
            .field("columns", &self.columns)
            .field("pending", &self.pending.len())
            .field("row_count", &self.row_count)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteSession;
    use crate::config::{SessionSettings, SqliteDescriptor};
    use std::time::Duration;

    fn session() -> Arc<dyn Session> {
        let descriptor = SqliteDescriptor {
            path: ":memory:".into(),
            timeout: Duration::from_secs(5),
            check_same_thread: false,
            isolation: None,
            session: SessionSettings::default(),
        };
        let conn: Arc<dyn Session> = Arc::new(SqliteSession::open(&descriptor).unwrap());
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, Name TEXT);
             INSERT INTO items (Name) VALUES ('a'), ('b'), ('c');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_mapping_rows_by_name() {
        let conn = session();
        let mut cur = Cursor::new(Arc::downgrade(&conn), true);
        cur.execute("SELECT id, Name FROM items ORDER BY id", &[])
            .unwrap();
        let row = cur.fetch_one().unwrap().unwrap();
        assert_eq!(row[0], Value::Integer(1));
        assert_eq!(row.get_by_name("Name"), Some(&Value::from("a")));
        assert_eq!(row.get_by_name("name"), Some(&Value::from("a")));
        assert_eq!(row.keys().unwrap(), ["id", "Name"]);
    }

    #[test]
    fn test_plain_rows_have_no_names() {
        let conn = session();
        let mut cur = Cursor::new(Arc::downgrade(&conn), false);
        cur.execute("SELECT id FROM items", &[]).unwrap();
        let row = cur.fetch_one().unwrap().unwrap();
        assert!(row.get_by_name("id").is_none());
        assert!(row.keys().is_none());
        assert_eq!(row.get(0), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_fetch_many_and_all() {
        let conn = session();
        let mut cur = Cursor::new(Arc::downgrade(&conn), false);
        cur.execute("SELECT id FROM items ORDER BY id", &[]).unwrap();
        assert_eq!(cur.fetch_many(2).unwrap().len(), 2);
        assert_eq!(cur.fetch_all().unwrap().len(), 1);
        assert!(cur.fetch_one().unwrap().is_none());
    }

    #[test]
    fn test_row_count_for_dml() {
        let conn = session();
        let mut cur = Cursor::new(Arc::downgrade(&conn), false);
        cur.execute("UPDATE items SET Name = ?1", &[Value::from("z")])
            .unwrap();
        assert_eq!(cur.row_count(), Some(3));
        assert!(cur.columns().is_empty());
    }

    #[test]
    fn test_closed_cursor_rejects_use() {
        let conn = session();
        let mut cur = Cursor::new(Arc::downgrade(&conn), false);
        cur.close();
        cur.close();
        assert!(matches!(
            cur.execute("SELECT 1", &[]),
            Err(Error::CursorClosed)
        ));
        assert!(matches!(cur.fetch_one(), Err(Error::CursorClosed)));
    }

    #[test]
    fn test_cursor_does_not_keep_connection_alive() {
        let conn = session();
        let mut cur = Cursor::new(Arc::downgrade(&conn), false);
        drop(conn);
        assert!(matches!(
            cur.execute("SELECT 1", &[]),
            Err(Error::ConnectionClosed)
        ));
    }
}
