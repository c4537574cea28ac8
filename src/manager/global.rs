//! Process-wide managers, one per backend.
//!
//! Each accessor initializes its manager exactly once; later calls take a
//! lock-free fast path. The property path given by the first caller is kept
//! for the life of the process.

use super::ConnectionManager;
use crate::backend::{Backend, PostgresBackend, SqliteBackend};
use crate::config::resolve_properties_path;
use std::path::Path;
use std::sync::OnceLock;

static EMBEDDED: OnceLock<ConnectionManager<SqliteBackend>> = OnceLock::new();
static NETWORKED: OnceLock<ConnectionManager<PostgresBackend>> = OnceLock::new();

fn get_or_init<B: Backend + Default>(
    cell: &'static OnceLock<ConnectionManager<B>>,
    path: &Path,
) -> &'static ConnectionManager<B> {
    let manager = cell.get_or_init(|| {
        tracing::debug!(target: "dbkeeper::manager", backend = B::NAME, path = %path.display(), "Creating process-wide manager");
        ConnectionManager::new(B::default(), path)
    });
    if manager.properties_path() != path {
        tracing::warn!(
            target: "dbkeeper::manager",
            backend = B::NAME,
            requested = %path.display(),
            active = %manager.properties_path().display(),
            "Manager already initialized with a different properties file; ignoring"
        );
    }
    manager
}

/// Returns the process-wide `SQLite` manager.
pub fn embedded(properties_path: impl AsRef<Path>) -> &'static ConnectionManager<SqliteBackend> {
    get_or_init(&EMBEDDED, properties_path.as_ref())
}

/// Returns the process-wide `SQLite` manager using the default property file.
///
/// See [`resolve_properties_path`] for the lookup order.
pub fn embedded_default() -> &'static ConnectionManager<SqliteBackend> {
    embedded(resolve_properties_path(None))
}

/// Returns the process-wide PostgreSQL manager.
pub fn networked(properties_path: impl AsRef<Path>) -> &'static ConnectionManager<PostgresBackend> {
    get_or_init(&NETWORKED, properties_path.as_ref())
}

/// Returns the process-wide PostgreSQL manager using the default property file.
///
/// See [`resolve_properties_path`] for the lookup order.
pub fn networked_default() -> &'static ConnectionManager<PostgresBackend> {
    networked(resolve_properties_path(None))
}
