//! Connection lifecycle management.
//!
//! [`ConnectionManager`] owns at most one physical connection. The connection
//! is created lazily by the first [`cursor`](ConnectionManager::cursor),
//! [`commit`](ConnectionManager::commit), or
//! [`rollback`](ConnectionManager::rollback), torn down by
//! [`close`](ConnectionManager::close), and recreated on the next call.
//!
//! ```text
//! Uninitialized ──first use──▶ Connected ──close()──▶ Uninitialized
//!                                  │
//!                                  └──found dead──▶ reconnect on the same call
//! ```
//!
//! # Concurrency Model
//!
//! State transitions (create, close, reconnect) run under a re-entrant lock,
//! so a thread that already holds it can call back into the manager. Statement
//! execution through cursors does not take this lock.

pub mod global;

use crate::backend::{Backend, Session};
use crate::config::Properties;
use crate::cursor::Cursor;
use crate::Result;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::instrument;

/// Shared handle to the manager's current connection.
pub type ConnectionHandle = Arc<dyn Session>;

/// State guarded by the manager lock.
struct ManagerState<B: Backend> {
    conn: Option<Arc<B::Connection>>,
    descriptor: Option<B::Descriptor>,
}

impl<B: Backend> Default for ManagerState<B> {
    fn default() -> Self {
        Self {
            conn: None,
            descriptor: None,
        }
    }
}

/// Lazily connecting manager for one backend.
///
/// Construct one per backend and share it by reference, or use the
/// process-wide instances in [`global`].
pub struct ConnectionManager<B: Backend> {
    backend: B,
    properties_path: PathBuf,
    state: ReentrantMutex<RefCell<ManagerState<B>>>,
    opened: AtomicU64,
}

impl<B: Backend> ConnectionManager<B> {
    /// Creates a manager that reads its settings from `properties_path`.
    ///
    /// Nothing is read or opened until the first operation.
    pub fn new(backend: B, properties_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            properties_path: properties_path.into(),
            state: ReentrantMutex::new(RefCell::new(ManagerState::default())),
            opened: AtomicU64::new(0),
        }
    }

    /// Returns the property file this manager reads.
    #[must_use]
    pub fn properties_path(&self) -> &Path {
        &self.properties_path
    }

    /// Returns the backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns true if a connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.conn.is_some()
    }

    /// Returns how many physical connections this manager has opened.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Returns the descriptor used for the most recent connection.
    #[must_use]
    pub fn descriptor(&self) -> Option<B::Descriptor> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.descriptor.clone()
    }

    /// Returns the live connection, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns configuration, storage, connection, or session setup errors. A
    /// connection that fails session setup is discarded, never cached.
    pub fn connection(&self) -> Result<ConnectionHandle> {
        let conn: ConnectionHandle = self.ensure_connection()?;
        Ok(conn)
    }

    #[instrument(skip(self), fields(backend = B::NAME))]
    fn ensure_connection(&self) -> Result<Arc<B::Connection>> {
        let guard = self.state.lock();

        let existing = guard.borrow().conn.clone();
        if let Some(conn) = existing {
            if self.backend.is_alive(&conn) {
                return Ok(conn);
            }
            tracing::info!(target: "dbkeeper::manager", backend = B::NAME, "Connection found closed, reconnecting");
            guard.borrow_mut().conn = None;
            if let Err(e) = conn.close() {
                tracing::debug!(target: "dbkeeper::manager", error = %e, "Ignoring error while discarding dead connection");
            }
        }

        let start = Instant::now();
        let conn = self.create_connection().inspect_err(|e| {
            metrics::counter!("dbkeeper_connection_failures_total", "backend" => B::NAME)
                .increment(1);
            tracing::warn!(target: "dbkeeper::manager", backend = B::NAME, error = %e, "Failed to create connection");
        })?;

        self.opened.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("dbkeeper_connections_opened_total", "backend" => B::NAME).increment(1);
        tracing::info!(
            target: "dbkeeper::manager",
            backend = B::NAME,
            elapsed_ms = start.elapsed().as_millis(),
            "Opened database connection"
        );

        guard.borrow_mut().conn = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Builds the descriptor, opens, and tunes a new connection.
    fn create_connection(&self) -> Result<Arc<B::Connection>> {
        let props = Properties::load(&self.properties_path)?;
        let descriptor = self.backend.build_descriptor(&props)?;
        let conn = self.backend.open(&descriptor)?;

        if let Err(e) = self.backend.tune(&conn, &descriptor) {
            if let Err(close_err) = conn.close() {
                tracing::debug!(target: "dbkeeper::manager", error = %close_err, "Ignoring error while discarding untuned connection");
            }
            return Err(e);
        }

        let guard = self.state.lock();
        guard.borrow_mut().descriptor = Some(descriptor);
        Ok(Arc::new(conn))
    }

    /// Returns a new cursor on the shared connection.
    ///
    /// With `as_mapping`, fetched rows can also be addressed by column name.
    ///
    /// # Errors
    ///
    /// Returns any error from creating the connection, or
    /// [`Error::ThreadAffinity`](crate::Error::ThreadAffinity) if the connection
    /// may not be used from this thread.
    pub fn cursor(&self, as_mapping: bool) -> Result<Cursor> {
        let conn = self.ensure_connection()?;
        conn.check_thread()?;
        let handle: ConnectionHandle = conn;
        Ok(Cursor::new(Arc::downgrade(&handle), as_mapping))
    }

    /// Returns a cursor together with the connection it is bound to.
    ///
    /// Both come from the same connection even if another thread calls
    /// [`close`](Self::close) concurrently.
    ///
    /// # Errors
    ///
    /// Same as [`cursor`](Self::cursor).
    pub fn cursor_and_connection(&self, as_mapping: bool) -> Result<(Cursor, ConnectionHandle)> {
        let _guard = self.state.lock();
        let cursor = self.cursor(as_mapping)?;
        let conn = self.connection()?;
        Ok((cursor, conn))
    }

    /// Commits the open transaction, connecting first if needed.
    ///
    /// Does nothing in autocommit mode.
    ///
    /// # Errors
    ///
    /// Returns any error from creating the connection or from the commit.
    pub fn commit(&self) -> Result<()> {
        self.ensure_connection()?.commit()
    }

    /// Rolls back the open transaction, connecting first if needed.
    ///
    /// Does nothing in autocommit mode.
    ///
    /// # Errors
    ///
    /// Returns any error from creating the connection or from the rollback.
    pub fn rollback(&self) -> Result<()> {
        self.ensure_connection()?.rollback()
    }

    /// Closes the connection if one is open. Closing twice is not an error.
    ///
    /// The next operation opens a new connection with the same configuration.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if closing fails; the handle is cleared
    /// regardless.
    pub fn close(&self) -> Result<()> {
        let guard = self.state.lock();
        let conn = guard.borrow_mut().conn.take();
        if let Some(conn) = conn {
            conn.close()?;
            tracing::info!(target: "dbkeeper::manager", backend = B::NAME, "Closed database connection");
        }
        Ok(())
    }
}

impl<B: Backend> std::fmt::Debug for ConnectionManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend", &B::NAME)
            .field("properties_path", &self.properties_path)
            .field("connected", &self.is_connected())
            .field("connections_opened", &self.connections_opened())
            .finish_non_exhaustive()
    }
}
