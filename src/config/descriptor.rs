//! Backend connection descriptors built from [`Properties`].
//!
//! A descriptor is the validated, normalized form of the raw property map.
//! Validation collects every offending key before failing so that a single
//! [`Error::ConfigInvalid`] names all of them.

use super::Properties;
use crate::{Error, Result};
use secrecy::SecretString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path sentinel selecting an in-memory `SQLite` database.
pub const MEMORY_PATH: &str = ":memory:";

/// Default `SQLite` busy timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

/// Largest accepted `SQLite` busy timeout, in milliseconds.
///
/// `SQLite` stores the busy timeout as a C `int`.
pub const MAX_TIMEOUT_MILLIS: u128 = i32::MAX as u128;

/// Default PostgreSQL port.
pub const DEFAULT_PORT: u16 = 5432;

/// Property keys understood by the builders.
pub mod keys {
    /// `SQLite` database file or `:memory:`.
    pub const PATH: &str = "db.path";
    /// `SQLite` busy timeout in seconds.
    pub const TIMEOUT: &str = "db.timeout";
    /// Restrict the `SQLite` connection to its creating thread.
    pub const CHECK_SAME_THREAD: &str = "db.check_same_thread";
    /// `SQLite` transaction mode; empty means autocommit.
    pub const ISOLATION_LEVEL: &str = "db.isolation_level";
    /// `SQLite` journal mode pragma.
    pub const JOURNAL_MODE: &str = "db.journal_mode";
    /// `SQLite` foreign key enforcement pragma.
    pub const FOREIGN_KEYS: &str = "db.foreign_keys";
    /// PostgreSQL host.
    pub const HOST: &str = "db.host";
    /// PostgreSQL port.
    pub const PORT: &str = "db.port";
    /// PostgreSQL database name.
    pub const NAME: &str = "db.name";
    /// PostgreSQL user.
    pub const USER: &str = "db.user";
    /// PostgreSQL password.
    pub const PASSWORD: &str = "db.password";
    /// PostgreSQL TLS mode.
    pub const SSLMODE: &str = "db.sslmode";
    /// PostgreSQL connect timeout in seconds.
    pub const CONNECT_TIMEOUT: &str = "db.connect_timeout";
}

/// Accumulates invalid keys while a descriptor is being built.
#[derive(Default)]
struct Problems {
    keys: Vec<String>,
    reasons: Vec<String>,
}

impl Problems {
    fn push(&mut self, key: &str, reason: impl Into<String>) {
        self.keys.push(key.to_string());
        self.reasons.push(reason.into());
    }

    fn into_result(self) -> Result<()> {
        if self.keys.is_empty() {
            return Ok(());
        }
        Err(Error::ConfigInvalid {
            keys: self.keys,
            reason: self.reasons.join("; "),
        })
    }
}

/// `SQLite` transaction mode used when autocommit is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// `BEGIN DEFERRED`.
    Deferred,
    /// `BEGIN IMMEDIATE`.
    Immediate,
    /// `BEGIN EXCLUSIVE`.
    Exclusive,
}

impl IsolationLevel {
    /// Parses an isolation level, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "DEFERRED" => Some(Self::Deferred),
            "IMMEDIATE" => Some(Self::Immediate),
            "EXCLUSIVE" => Some(Self::Exclusive),
            _ => None,
        }
    }

    /// Returns the statement that opens a transaction in this mode.
    #[must_use]
    pub const fn begin_statement(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deferred => "DEFERRED",
            Self::Immediate => "IMMEDIATE",
            Self::Exclusive => "EXCLUSIVE",
        };
        f.write_str(s)
    }
}

/// Session pragmas applied once per `SQLite` connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSettings {
    /// Journal mode, applied verbatim.
    pub journal_mode: Option<String>,
    /// Foreign key enforcement.
    pub foreign_keys: Option<bool>,
}

impl SessionSettings {
    /// Returns true if no pragma needs to be applied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.journal_mode.is_none() && self.foreign_keys.is_none()
    }
}

/// Validated settings for the embedded `SQLite` backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteDescriptor {
    /// Database file, or [`MEMORY_PATH`].
    pub path: PathBuf,
    /// Busy timeout.
    pub timeout: Duration,
    /// Only the creating thread may use the connection.
    pub check_same_thread: bool,
    /// Transaction mode; `None` is autocommit.
    pub isolation: Option<IsolationLevel>,
    /// Pragmas applied after connecting.
    pub session: SessionSettings,
}

impl SqliteDescriptor {
    /// Builds a descriptor from properties.
    ///
    /// Creates the parent directory of a file database if it is missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] naming every missing or malformed key,
    /// or [`Error::StorageUnavailable`] if the parent directory cannot be created.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let mut problems = Problems::default();

        let path = props.get_nonempty(keys::PATH).map(PathBuf::from);
        if path.is_none() {
            problems.push(keys::PATH, "missing required property");
        }

        let timeout = match props.get_nonempty(keys::TIMEOUT) {
            None => Some(Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS)),
            Some(raw) => match raw.parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs > 0.0 => {
                    match Duration::try_from_secs_f64(secs) {
                        Ok(timeout) if timeout.as_millis() <= MAX_TIMEOUT_MILLIS => Some(timeout),
                        _ => {
                            problems.push(
                                keys::TIMEOUT,
                                format!(
                                    "'{raw}' exceeds the maximum of {} seconds",
                                    MAX_TIMEOUT_MILLIS / 1000
                                ),
                            );
                            None
                        },
                    }
                },
                Ok(_) => {
                    problems.push(keys::TIMEOUT, format!("'{raw}' must be a positive number"));
                    None
                },
                Err(_) => {
                    problems.push(keys::TIMEOUT, format!("'{raw}' is not a number"));
                    None
                },
            },
        };

        let isolation = match props.get(keys::ISOLATION_LEVEL).map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let level = IsolationLevel::parse(raw);
                if level.is_none() {
                    problems.push(
                        keys::ISOLATION_LEVEL,
                        format!("'{raw}' is not one of DEFERRED, IMMEDIATE, EXCLUSIVE"),
                    );
                }
                level
            },
        };

        problems.into_result()?;

        let (Some(path), Some(timeout)) = (path, timeout) else {
            return Err(Error::invalid_key(keys::PATH, "missing required property"));
        };

        let session = SessionSettings {
            journal_mode: props.get_nonempty(keys::JOURNAL_MODE).map(String::from),
            foreign_keys: props
                .get(keys::FOREIGN_KEYS)
                .map(|v| super::parse_bool(Some(v), false)),
        };

        let descriptor = Self {
            path,
            timeout,
            check_same_thread: props.get_bool(keys::CHECK_SAME_THREAD, true),
            isolation,
            session,
        };
        descriptor.ensure_parent_dir()?;
        Ok(descriptor)
    }

    /// Returns true for the in-memory sentinel.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_PATH
    }

    /// Returns true when statements commit immediately.
    #[must_use]
    pub const fn is_autocommit(&self) -> bool {
        self.isolation.is_none()
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if self.is_memory() {
            return Ok(());
        }
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        if parent.exists() {
            return Ok(());
        }
        create_dir(parent)
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| Error::StorageUnavailable {
        path: dir.display().to_string(),
        cause: e.to_string(),
    })?;
    tracing::debug!(target: "dbkeeper::config", dir = %dir.display(), "Created database directory");
    Ok(())
}

/// TLS negotiation mode for PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    /// Never use TLS.
    Disable,
    /// Use TLS if the server supports it.
    Prefer,
    /// Require TLS.
    Require,
}

impl SslMode {
    /// Parses an `sslmode` value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "disable" => Some(Self::Disable),
            "prefer" => Some(Self::Prefer),
            "require" => Some(Self::Require),
            _ => None,
        }
    }
}

/// Validated settings for the networked PostgreSQL backend.
#[derive(Debug, Clone)]
pub struct PostgresDescriptor {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database name.
    pub dbname: String,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: SecretString,
    /// TLS mode, if configured.
    pub sslmode: Option<SslMode>,
    /// Connect timeout, if configured.
    pub connect_timeout: Option<Duration>,
}

impl PostgresDescriptor {
    /// Builds a descriptor from properties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] naming every missing or malformed key.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let mut problems = Problems::default();

        let mut required = |key: &str| {
            let value = props.get_nonempty(key).map(String::from);
            if value.is_none() {
                problems.push(key, "missing required property");
            }
            value
        };
        let host = required(keys::HOST);
        let dbname = required(keys::NAME);
        let user = required(keys::USER);
        let password = required(keys::PASSWORD);

        let port = match props.get_nonempty(keys::PORT) {
            None => Some(DEFAULT_PORT),
            Some(raw) => {
                let port = raw.parse::<u16>().ok();
                if port.is_none() {
                    problems.push(keys::PORT, format!("'{raw}' is not a valid port"));
                }
                port
            },
        };

        let sslmode = match props.get_nonempty(keys::SSLMODE) {
            None => None,
            Some(raw) => {
                let mode = SslMode::parse(raw);
                match mode {
                    None => problems.push(
                        keys::SSLMODE,
                        format!("'{raw}' is not one of disable, prefer, require"),
                    ),
                    Some(SslMode::Require) if !cfg!(feature = "postgres-tls") => problems.push(
                        keys::SSLMODE,
                        "'require' needs a build with the postgres-tls feature",
                    ),
                    Some(_) => {},
                }
                mode
            },
        };

        let connect_timeout = match props.get_nonempty(keys::CONNECT_TIMEOUT) {
            None => None,
            Some(raw) => {
                let secs = raw.parse::<u64>().ok();
                if secs.is_none() {
                    problems.push(
                        keys::CONNECT_TIMEOUT,
                        format!("'{raw}' is not a whole number of seconds"),
                    );
                }
                secs.map(Duration::from_secs)
            },
        };

        problems.into_result()?;

        match (host, dbname, user, password, port) {
            (Some(host), Some(dbname), Some(user), Some(password), Some(port)) => Ok(Self {
                host,
                port,
                dbname,
                user,
                password: SecretString::from(password),
                sslmode,
                connect_timeout,
            }),
            _ => Err(Error::invalid_key(keys::HOST, "incomplete configuration")),
        }
    }
}

/// A validated descriptor for either backend.
#[derive(Debug, Clone)]
pub enum ConnectionDescriptor {
    /// Embedded `SQLite`.
    Embedded(SqliteDescriptor),
    /// Networked PostgreSQL.
    Networked(PostgresDescriptor),
}

impl ConnectionDescriptor {
    /// Returns the backend name.
    #[must_use]
    pub const fn backend_name(&self) -> &'static str {
        match self {
            Self::Embedded(_) => "sqlite",
            Self::Networked(_) => "postgres",
        }
    }

    /// Returns a one-line description with secrets omitted.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Embedded(d) => format!(
                "sqlite path={} timeout={:.1}s check_same_thread={} isolation={}",
                d.path.display(),
                d.timeout.as_secs_f64(),
                d.check_same_thread,
                d.isolation
                    .map_or_else(|| "autocommit".to_string(), |l| l.to_string()),
            ),
            Self::Networked(d) => format!(
                "postgres host={} port={} dbname={} user={}",
                d.host, d.port, d.dbname, d.user
            ),
        }
    }
}

impl From<SqliteDescriptor> for ConnectionDescriptor {
    fn from(d: SqliteDescriptor) -> Self {
        Self::Embedded(d)
    }
}

impl From<PostgresDescriptor> for ConnectionDescriptor {
    fn from(d: PostgresDescriptor) -> Self {
        Self::Networked(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_sqlite_defaults() {
        let d = SqliteDescriptor::from_properties(&props(&[("db.path", ":memory:")])).unwrap();
        assert!(d.is_memory());
        assert_eq!(d.timeout, Duration::from_secs(5));
        assert!(d.check_same_thread);
        assert!(d.is_autocommit());
        assert!(d.session.is_empty());
    }

    #[test]
    fn test_sqlite_missing_path() {
        let err = SqliteDescriptor::from_properties(&props(&[])).unwrap_err();
        match err {
            Error::ConfigInvalid { keys, .. } => assert_eq!(keys, vec!["db.path"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sqlite_bad_timeout_and_isolation_reported_together() {
        let err = SqliteDescriptor::from_properties(&props(&[
            ("db.path", ":memory:"),
            ("db.timeout", "soon"),
            ("db.isolation_level", "SERIALIZABLE"),
        ]))
        .unwrap_err();
        match err {
            Error::ConfigInvalid { keys, .. } => {
                assert_eq!(keys, vec!["db.timeout", "db.isolation_level"]);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sqlite_negative_timeout_rejected() {
        let err = SqliteDescriptor::from_properties(&props(&[
            ("db.path", ":memory:"),
            ("db.timeout", "-1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_sqlite_oversized_timeout_rejected() {
        for raw in ["1e300", "3000000"] {
            let err = SqliteDescriptor::from_properties(&props(&[
                ("db.path", ":memory:"),
                ("db.timeout", raw),
            ]))
            .unwrap_err();
            match err {
                Error::ConfigInvalid { keys, .. } => assert_eq!(keys, vec!["db.timeout"]),
                other => panic!("unexpected error for {raw}: {other}"),
            }
        }
    }

    #[test]
    fn test_sqlite_largest_timeout_accepted() {
        let d = SqliteDescriptor::from_properties(&props(&[
            ("db.path", ":memory:"),
            ("db.timeout", "2000000"),
        ]))
        .unwrap();
        assert_eq!(d.timeout, Duration::from_secs(2_000_000));
    }

    #[test]
    fn test_sqlite_empty_foreign_keys_means_off() {
        let d = SqliteDescriptor::from_properties(&props(&[
            ("db.path", ":memory:"),
            ("db.foreign_keys", ""),
        ]))
        .unwrap();
        assert_eq!(d.session.foreign_keys, Some(false));

        let d = SqliteDescriptor::from_properties(&props(&[("db.path", ":memory:")])).unwrap();
        assert_eq!(d.session.foreign_keys, None);
    }

    #[test]
    fn test_sqlite_isolation_and_session() {
        let d = SqliteDescriptor::from_properties(&props(&[
            ("db.path", ":memory:"),
            ("db.timeout", "2.5"),
            ("db.check_same_thread", "no"),
            ("db.isolation_level", "immediate"),
            ("db.journal_mode", "WAL"),
            ("db.foreign_keys", "on"),
        ]))
        .unwrap();
        assert_eq!(d.timeout, Duration::from_millis(2500));
        assert!(!d.check_same_thread);
        assert_eq!(d.isolation, Some(IsolationLevel::Immediate));
        assert_eq!(d.session.journal_mode.as_deref(), Some("WAL"));
        assert_eq!(d.session.foreign_keys, Some(true));
    }

    #[test]
    fn test_sqlite_empty_isolation_is_autocommit() {
        let d = SqliteDescriptor::from_properties(&props(&[
            ("db.path", ":memory:"),
            ("db.isolation_level", "  "),
        ]))
        .unwrap();
        assert!(d.is_autocommit());
    }

    #[test]
    fn test_sqlite_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("deeper").join("app.db");
        let d = SqliteDescriptor::from_properties(&props(&[(
            "db.path",
            db_path.to_str().unwrap(),
        )]))
        .unwrap();
        assert_eq!(d.path, db_path);
        assert!(dir.path().join("nested").join("deeper").is_dir());
    }

    #[test]
    fn test_sqlite_parent_dir_blocked_by_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let db_path = blocker.join("sub").join("app.db");
        let err = SqliteDescriptor::from_properties(&props(&[(
            "db.path",
            db_path.to_str().unwrap(),
        )]))
        .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { .. }));
    }

    #[test]
    fn test_postgres_missing_host_and_user_single_error() {
        let err = PostgresDescriptor::from_properties(&props(&[
            ("db.name", "app"),
            ("db.password", "secret"),
        ]))
        .unwrap_err();
        match err {
            Error::ConfigInvalid { keys, .. } => assert_eq!(keys, vec!["db.host", "db.user"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_postgres_defaults_and_options() {
        let d = PostgresDescriptor::from_properties(&props(&[
            ("db.host", "db.internal"),
            ("db.name", "app"),
            ("db.user", "svc"),
            ("db.password", "secret"),
            ("db.sslmode", "Prefer"),
            ("db.connect_timeout", "7"),
        ]))
        .unwrap();
        assert_eq!(d.port, DEFAULT_PORT);
        assert_eq!(d.sslmode, Some(SslMode::Prefer));
        assert_eq!(d.connect_timeout, Some(Duration::from_secs(7)));
        assert_eq!(d.password.expose_secret(), "secret");
    }

    #[test]
    fn test_postgres_bad_port() {
        let err = PostgresDescriptor::from_properties(&props(&[
            ("db.host", "h"),
            ("db.name", "n"),
            ("db.user", "u"),
            ("db.password", "p"),
            ("db.port", "fifty"),
        ]))
        .unwrap_err();
        match err {
            Error::ConfigInvalid { keys, .. } => assert_eq!(keys, vec!["db.port"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_postgres_debug_redacts_password() {
        let d = PostgresDescriptor::from_properties(&props(&[
            ("db.host", "h"),
            ("db.name", "n"),
            ("db.user", "u"),
            ("db.password", "hunter2"),
        ]))
        .unwrap();
        let rendered = format!("{d:?}");
        assert!(!rendered.contains("hunter2"));
        let summary = ConnectionDescriptor::from(d).summary();
        assert!(!summary.contains("hunter2"));
    }

    fn require_tls_props() -> Properties {
        props(&[
            ("db.host", "h"),
            ("db.name", "n"),
            ("db.user", "u"),
            ("db.password", "p"),
            ("db.sslmode", "require"),
        ])
    }

    #[cfg(not(feature = "postgres-tls"))]
    #[test]
    fn test_postgres_require_tls_rejected_without_tls_support() {
        match PostgresDescriptor::from_properties(&require_tls_props()).unwrap_err() {
            Error::ConfigInvalid { keys, .. } => assert_eq!(keys, vec!["db.sslmode"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(feature = "postgres-tls")]
    #[test]
    fn test_postgres_require_tls_accepted_with_tls_support() {
        let d = PostgresDescriptor::from_properties(&require_tls_props()).unwrap();
        assert_eq!(d.sslmode, Some(SslMode::Require));
    }
}
