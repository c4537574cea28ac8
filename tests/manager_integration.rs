//! Connection manager integration tests.
//!
//! Exercises the manager end to end against file-backed `SQLite` databases:
//! - Lazy creation under concurrent first use
//! - Close and transparent reconnect
//! - Autocommit versus explicit transaction visibility
//! - Property file parsing and descriptor validation

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use dbkeeper::backend::PostgresBackend;
use dbkeeper::{ConnectionManager, Error, Properties, SqliteBackend, Value};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn write_properties(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).expect("create properties");
    file.write_all(contents.as_bytes()).expect("write properties");
    path
}

fn file_db_properties(dir: &TempDir, isolation: &str) -> std::path::PathBuf {
    let db = dir.path().join("data").join("app.db");
    write_properties(
        dir.path(),
        &format!("db-{}.properties", isolation.to_lowercase()),
        &format!(
            "db.path = {}\ndb.isolation_level = {isolation}\ndb.check_same_thread = false\n",
            db.display()
        ),
    )
}

fn count_rows(manager: &ConnectionManager<SqliteBackend>) -> i64 {
    let mut cur = manager.cursor(false).unwrap();
    cur.execute("SELECT COUNT(*) FROM items", &[]).unwrap();
    let row = cur.fetch_one().unwrap().unwrap();
    row[0].as_i64().unwrap()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_concurrent_first_use_opens_one_connection() {
    let dir = TempDir::new().unwrap();
    let path = write_properties(
        dir.path(),
        "db.properties",
        "db.path = :memory:\ndb.check_same_thread = false\n",
    );
    let manager = Arc::new(ConnectionManager::new(SqliteBackend, path));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut cur = manager.cursor(false).unwrap();
                cur.execute("SELECT 1", &[]).unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(manager.connections_opened(), 1);
}

#[test]
fn test_same_thread_connection_rejects_other_threads() {
    let dir = TempDir::new().unwrap();
    let path = write_properties(
        dir.path(),
        "db.properties",
        "db.path = :memory:\ndb.check_same_thread = true\n",
    );
    let manager = Arc::new(ConnectionManager::new(SqliteBackend, path));
    let mut cur = manager.cursor(false).unwrap();
    cur.execute("SELECT 1", &[]).unwrap();

    let other = Arc::clone(&manager);
    let rejected = thread::spawn(move || {
        matches!(other.cursor(false), Err(Error::ThreadAffinity { .. }))
    })
    .join()
    .unwrap();

    assert!(rejected);
    assert_eq!(manager.connections_opened(), 1);
    manager.cursor(false).unwrap();
}

#[test]
fn test_close_then_reuse_reconnects() {
    let dir = TempDir::new().unwrap();
    let path = file_db_properties(&dir, "");
    let manager = ConnectionManager::new(SqliteBackend, path);

    let mut cur = manager.cursor(false).unwrap();
    cur.execute_batch("CREATE TABLE items (name TEXT)").unwrap();
    cur.execute("INSERT INTO items VALUES (?1)", &[Value::from("first")])
        .unwrap();
    manager.close().unwrap();
    assert!(!manager.is_connected());

    // The data lives in the file, so a fresh connection sees it.
    assert_eq!(count_rows(&manager), 1);
    assert_eq!(manager.connections_opened(), 2);
}

#[test]
fn test_missing_properties_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(SqliteBackend, dir.path().join("absent.properties"));
    let err = manager.cursor(false).unwrap_err();
    assert!(matches!(err, Error::ConfigNotFound { .. }), "got {err:?}");
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn test_autocommit_writes_are_visible_without_commit() {
    let dir = TempDir::new().unwrap();
    let path = file_db_properties(&dir, "");
    let writer = ConnectionManager::new(SqliteBackend, &path);
    let reader = ConnectionManager::new(SqliteBackend, &path);

    let mut cur = writer.cursor(false).unwrap();
    cur.execute_batch("CREATE TABLE items (name TEXT)").unwrap();
    cur.execute("INSERT INTO items VALUES (?1)", &[Value::from("a")])
        .unwrap();

    assert_eq!(count_rows(&reader), 1);
}

#[test]
fn test_deferred_writes_are_hidden_until_commit() {
    let dir = TempDir::new().unwrap();
    let path = file_db_properties(&dir, "DEFERRED");
    let writer = ConnectionManager::new(SqliteBackend, &path);
    let reader = ConnectionManager::new(SqliteBackend, &path);

    let mut cur = writer.cursor(false).unwrap();
    cur.execute_batch("CREATE TABLE items (name TEXT)").unwrap();
    cur.execute("INSERT INTO items VALUES (?1)", &[Value::from("a")])
        .unwrap();

    assert_eq!(count_rows(&reader), 0);
    writer.commit().unwrap();
    assert_eq!(count_rows(&reader), 1);
}

#[test]
fn test_rollback_discards_pending_writes() {
    let dir = TempDir::new().unwrap();
    let path = file_db_properties(&dir, "IMMEDIATE");
    let manager = ConnectionManager::new(SqliteBackend, path);

    let mut cur = manager.cursor(false).unwrap();
    cur.execute_batch("CREATE TABLE items (name TEXT)").unwrap();
    cur.execute("INSERT INTO items VALUES (?1)", &[Value::from("a")])
        .unwrap();
    manager.rollback().unwrap();

    assert_eq!(count_rows(&manager), 0);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_property_file_ignores_comments_and_blank_lines() {
    let dir = TempDir::new().unwrap();
    let path = write_properties(dir.path(), "p.properties", "# comment\n\nkey = value\n");
    let props = Properties::load(&path).unwrap();
    assert_eq!(props.len(), 1);
    assert_eq!(props.get("key"), Some("value"));
}

#[test]
fn test_networked_reports_all_missing_keys_at_once() {
    let dir = TempDir::new().unwrap();
    let path = write_properties(
        dir.path(),
        "pg.properties",
        "db.name = app\ndb.password = secret\n",
    );
    let manager = ConnectionManager::new(PostgresBackend, path);
    match manager.cursor(false) {
        Err(Error::ConfigInvalid { keys, .. }) => {
            assert_eq!(keys, vec!["db.host".to_string(), "db.user".to_string()]);
        },
        other => panic!("expected ConfigInvalid, got {other:?}"),
    }
    assert!(!manager.is_connected());
}

#[test]
fn test_session_pragmas_applied() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("wal.db");
    let path = write_properties(
        dir.path(),
        "wal.properties",
        &format!(
            "db.path = {}\ndb.journal_mode = WAL\ndb.foreign_keys = on\n",
            db.display()
        ),
    );
    let manager = ConnectionManager::new(SqliteBackend, path);

    let mut cur = manager.cursor(true).unwrap();
    cur.execute("PRAGMA journal_mode", &[]).unwrap();
    let row = cur.fetch_one().unwrap().unwrap();
    assert_eq!(row[0].as_str().map(str::to_lowercase).as_deref(), Some("wal"));

    cur.execute("PRAGMA foreign_keys", &[]).unwrap();
    let row = cur.fetch_one().unwrap().unwrap();
    assert_eq!(row[0].as_i64(), Some(1));
}
