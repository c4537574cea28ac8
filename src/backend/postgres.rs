//! Networked PostgreSQL backend.
//!
//! The async `tokio-postgres` client is driven from blocking callers through a
//! current-thread runtime owned by each session. Like most PostgreSQL drivers,
//! the first statement outside a transaction opens one, and nothing is visible
//! to other sessions until `commit`.
//!
//! Requires the `postgres` feature; without it, [`PostgresBackend::open`]
//! returns [`Error::FeatureNotEnabled`](crate::Error::FeatureNotEnabled).
//! TLS (`db.sslmode = prefer` or `require`) uses rustls with the
//! `postgres-tls` feature. Without it `prefer` connects in plaintext.

use super::Backend;
use crate::Result;
use crate::config::{PostgresDescriptor, Properties};

const NAME: &str = "postgres";

/// The networked PostgreSQL backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresBackend;

impl Backend for PostgresBackend {
    type Descriptor = PostgresDescriptor;
    type Connection = PostgresSession;

    const NAME: &'static str = NAME;

    fn build_descriptor(&self, props: &Properties) -> Result<PostgresDescriptor> {
        PostgresDescriptor::from_properties(props)
    }

    fn open(&self, descriptor: &PostgresDescriptor) -> Result<PostgresSession> {
        PostgresSession::connect(descriptor)
    }

    fn is_alive(&self, conn: &PostgresSession) -> bool {
        conn.poll_alive()
    }
}

#[cfg(feature = "postgres")]
mod implementation {
    use super::NAME;
    use crate::backend::{Session, StatementOutput};
    use crate::config::{PostgresDescriptor, SslMode};
    use crate::value::Value;
    use crate::{Error, Result};
    use bytes::BytesMut;
    use parking_lot::Mutex;
    use secrecy::ExposeSecret;
    use tokio::runtime::Runtime;
    use tokio_postgres::tls::MakeTlsConnect;
    use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
    use tokio_postgres::{Client, NoTls, Row, Socket};

    type BoxError = Box<dyn std::error::Error + Sync + Send>;

    /// Helper to map query errors.
    fn query_error(op: &str, e: impl std::fmt::Display) -> Error {
        Error::query(op, e)
    }

    struct Inner {
        client: Client,
        in_transaction: bool,
    }

    /// A PostgreSQL connection shared through the manager.
    pub struct PostgresSession {
        runtime: Runtime,
        /// `None` once closed.
        inner: Mutex<Option<Inner>>,
    }

    impl PostgresSession {
        /// Connects to the server described by `descriptor`.
        ///
        /// # Errors
        ///
        /// Returns [`Error::ConnectionFailed`] if the server cannot be reached or
        /// rejects the login.
        pub fn connect(descriptor: &PostgresDescriptor) -> Result<Self> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::OperationFailed {
                    operation: "postgres_create_runtime".to_string(),
                    cause: e.to_string(),
                })?;

            let config = Self::build_config(descriptor);
            let connected = match descriptor.sslmode {
                None | Some(SslMode::Disable) => runtime.block_on(spawn_connection(&config, NoTls)),
                Some(SslMode::Prefer | SslMode::Require) => {
                    let tls = tls::connector()?;
                    runtime.block_on(spawn_connection(&config, tls))
                },
            };
            let client = connected.map_err(|e| Error::ConnectionFailed {
                backend: NAME,
                cause: format!("{}:{}: {e}", descriptor.host, descriptor.port),
            })?;

            Ok(Self {
                runtime,
                inner: Mutex::new(Some(Inner {
                    client,
                    in_transaction: false,
                })),
            })
        }

        /// Builds a tokio-postgres config from a descriptor.
        fn build_config(descriptor: &PostgresDescriptor) -> tokio_postgres::Config {
            let mut config = tokio_postgres::Config::new();
            config
                .host(&descriptor.host)
                .port(descriptor.port)
                .dbname(&descriptor.dbname)
                .user(&descriptor.user)
                .password(descriptor.password.expose_secret())
                .application_name("dbkeeper");
            if let Some(mode) = descriptor.sslmode {
                config.ssl_mode(match mode {
                    SslMode::Disable => tokio_postgres::config::SslMode::Disable,
                    SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
                    SslMode::Require => tokio_postgres::config::SslMode::Require,
                });
            }
            if let Some(timeout) = descriptor.connect_timeout {
                config.connect_timeout(timeout);
            }
            config
        }

        /// Lets the connection task observe a server-side close, then reports liveness.
        pub(super) fn poll_alive(&self) -> bool {
            self.runtime.block_on(tokio::task::yield_now());
            !self.is_closed()
        }

        fn with_client<T>(&self, f: impl FnOnce(&Runtime, &mut Inner) -> Result<T>) -> Result<T> {
            let mut guard = self.inner.lock();
            let inner = guard.as_mut().ok_or(Error::ConnectionClosed)?;
            if inner.client.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            f(&self.runtime, inner)
        }

        fn begin_if_needed(runtime: &Runtime, inner: &mut Inner) -> Result<()> {
            if !inner.in_transaction {
                runtime
                    .block_on(inner.client.batch_execute("BEGIN"))
                    .map_err(|e| query_error("begin", e))?;
                inner.in_transaction = true;
            }
            Ok(())
        }

        fn finish(&self, statement: &str) -> Result<()> {
            self.with_client(|runtime, inner| {
                if !inner.in_transaction {
                    return Ok(());
                }
                inner.in_transaction = false;
                runtime
                    .block_on(inner.client.batch_execute(statement))
                    .map_err(|e| query_error(&statement.to_lowercase(), e))
            })
        }
    }

    /// Connects and spawns the connection task on the current runtime.
    async fn spawn_connection<T>(
        config: &tokio_postgres::Config,
        tls: T,
    ) -> std::result::Result<Client, tokio_postgres::Error>
    where
        T: MakeTlsConnect<Socket>,
        T::Stream: Send + 'static,
    {
        let (client, connection) = config.connect(tls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(target: "dbkeeper::postgres", error = %e, "Connection task ended with error");
            }
        });
        Ok(client)
    }

    #[cfg(feature = "postgres-tls")]
    mod tls {
        use crate::{Error, Result};
        use std::sync::Arc;
        use tokio_postgres_rustls::MakeRustlsConnect;

        /// Builds a rustls connector trusting the Mozilla root set.
        pub(super) fn connector() -> Result<MakeRustlsConnect> {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::OperationFailed {
                operation: "postgres_tls_config".to_string(),
                cause: e.to_string(),
            })?
            .with_root_certificates(roots)
            .with_no_client_auth();
            Ok(MakeRustlsConnect::new(config))
        }
    }

    #[cfg(not(feature = "postgres-tls"))]
    mod tls {
        use crate::Result;
        use tokio_postgres::NoTls;

        /// Without TLS support `prefer` falls back to plaintext; `require` is
        /// rejected when the descriptor is built.
        #[allow(clippy::unnecessary_wraps)]
        pub(super) const fn connector() -> Result<NoTls> {
            Ok(NoTls)
        }
    }

    impl Session for PostgresSession {
        fn backend_name(&self) -> &'static str {
            NAME
        }

        fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementOutput> {
            self.with_client(|runtime, inner| {
                Self::begin_if_needed(runtime, inner)?;
                let stmt = runtime
                    .block_on(inner.client.prepare(sql))
                    .map_err(|e| query_error("prepare", e))?;
                let bound: Vec<&(dyn ToSql + Sync)> =
                    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

                if stmt.columns().is_empty() {
                    let changed = runtime
                        .block_on(inner.client.execute(&stmt, &bound))
                        .map_err(|e| query_error("execute", e))?;
                    return Ok(StatementOutput {
                        columns: Vec::new(),
                        rows: Vec::new(),
                        rows_affected: Some(changed),
                    });
                }

                let columns = stmt
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
                let rows = runtime
                    .block_on(inner.client.query(&stmt, &bound))
                    .map_err(|e| query_error("query", e))?;
                let rows = rows.iter().map(convert_row).collect::<Result<Vec<_>>>()?;

                Ok(StatementOutput {
                    columns,
                    rows,
                    rows_affected: None,
                })
            })
        }

        fn execute_batch(&self, sql: &str) -> Result<()> {
            self.with_client(|runtime, inner| {
                Self::begin_if_needed(runtime, inner)?;
                runtime
                    .block_on(inner.client.batch_execute(sql))
                    .map_err(|e| query_error("execute_batch", e))
            })
        }

        fn commit(&self) -> Result<()> {
            self.finish("COMMIT")
        }

        fn rollback(&self) -> Result<()> {
            self.finish("ROLLBACK")
        }

        fn in_transaction(&self) -> bool {
            self.inner
                .lock()
                .as_ref()
                .is_some_and(|inner| inner.in_transaction)
        }

        fn close(&self) -> Result<()> {
            let inner = self.inner.lock().take();
            if let Some(inner) = inner {
                drop(inner.client);
                // Let the connection task see the dropped client and exit.
                self.runtime.block_on(tokio::task::yield_now());
            }
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.inner
                .lock()
                .as_ref()
                .is_none_or(|inner| inner.client.is_closed())
        }
    }

    /// Converts a result row into values.
    fn convert_row(row: &Row) -> Result<Vec<Value>> {
        (0..row.len()).map(|idx| convert_cell(row, idx)).collect()
    }

    /// Converts one cell, choosing the Rust type from the column type.
    fn convert_cell(row: &Row, idx: usize) -> Result<Value> {
        let ty = row.columns()[idx].type_();
        let fetch = |e: tokio_postgres::Error| query_error("fetch", e);

        let value = if *ty == Type::BOOL {
            Value::from(row.try_get::<_, Option<bool>>(idx).map_err(fetch)?)
        } else if *ty == Type::INT2 {
            Value::from(row.try_get::<_, Option<i16>>(idx).map_err(fetch)?.map(i64::from))
        } else if *ty == Type::INT4 {
            Value::from(row.try_get::<_, Option<i32>>(idx).map_err(fetch)?.map(i64::from))
        } else if *ty == Type::INT8 {
            Value::from(row.try_get::<_, Option<i64>>(idx).map_err(fetch)?)
        } else if *ty == Type::OID {
            Value::from(row.try_get::<_, Option<u32>>(idx).map_err(fetch)?.map(i64::from))
        } else if *ty == Type::FLOAT4 {
            Value::from(row.try_get::<_, Option<f32>>(idx).map_err(fetch)?.map(f64::from))
        } else if *ty == Type::FLOAT8 {
            Value::from(row.try_get::<_, Option<f64>>(idx).map_err(fetch)?)
        } else if *ty == Type::BYTEA {
            Value::from(row.try_get::<_, Option<Vec<u8>>>(idx).map_err(fetch)?)
        } else if *ty == Type::TIMESTAMPTZ {
            let ts: Option<chrono::DateTime<chrono::Utc>> = row.try_get(idx).map_err(fetch)?;
            Value::from(ts.map(|t| t.to_rfc3339()))
        } else if *ty == Type::TIMESTAMP {
            let ts: Option<chrono::NaiveDateTime> = row.try_get(idx).map_err(fetch)?;
            Value::from(ts.map(|t| t.to_string()))
        } else if *ty == Type::DATE {
            let d: Option<chrono::NaiveDate> = row.try_get(idx).map_err(fetch)?;
            Value::from(d.map(|d| d.to_string()))
        } else if *ty == Type::TIME {
            let t: Option<chrono::NaiveTime> = row.try_get(idx).map_err(fetch)?;
            Value::from(t.map(|t| t.to_string()))
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            let j: Option<serde_json::Value> = row.try_get(idx).map_err(fetch)?;
            Value::from(j.map(|j| j.to_string()))
        } else {
            let text: Option<String> = row.try_get(idx).map_err(|e| Error::QueryFailed {
                operation: "fetch".to_string(),
                cause: format!("unsupported column type {ty} (cast it to text): {e}"),
            })?;
            Value::from(text)
        };
        Ok(value)
    }

    /// Binds `value` after checking the parameter type accepts it.
    fn bind<T: ToSql>(
        value: T,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, BoxError> {
        if !T::accepts(ty) {
            return Err(format!(
                "cannot bind {} to a parameter of type {ty}",
                std::any::type_name::<T>()
            )
            .into());
        }
        value.to_sql(ty, out)
    }

    impl ToSql for Value {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
            match self {
                Self::Null => Ok(IsNull::Yes),
                Self::Bool(b) => bind(*b, ty, out),
                Self::Integer(v) => {
                    if *ty == Type::INT2 {
                        bind(i16::try_from(*v)?, ty, out)
                    } else if *ty == Type::INT4 {
                        bind(i32::try_from(*v)?, ty, out)
                    } else if *ty == Type::FLOAT4 {
                        bind(*v as f32, ty, out)
                    } else if *ty == Type::FLOAT8 {
                        bind(*v as f64, ty, out)
                    } else if *ty == Type::BOOL {
                        bind(*v != 0, ty, out)
                    } else {
                        bind(*v, ty, out)
                    }
                },
                Self::Real(v) => {
                    if *ty == Type::FLOAT4 {
                        bind(*v as f32, ty, out)
                    } else {
                        bind(*v, ty, out)
                    }
                },
                Self::Text(s) => bind(s.as_str(), ty, out),
                Self::Blob(b) => bind(b.as_slice(), ty, out),
            }
        }

        fn accepts(_ty: &Type) -> bool {
            true
        }

        to_sql_checked!();
    }

}

#[cfg(feature = "postgres")]
pub use implementation::PostgresSession;

#[cfg(not(feature = "postgres"))]
mod stub {
    use super::NAME;
    use crate::backend::{Session, StatementOutput};
    use crate::config::PostgresDescriptor;
    use crate::value::Value;
    use crate::{Error, Result};

    fn not_enabled() -> Error {
        Error::FeatureNotEnabled("postgres".to_string())
    }

    /// Stub PostgreSQL session when the feature is not enabled.
    ///
    /// It cannot be constructed; [`PostgresSession::connect`] always fails.
    pub struct PostgresSession {
        _private: (),
    }

    impl PostgresSession {
        /// Always fails - requires the `postgres` feature.
        ///
        /// # Errors
        ///
        /// Always returns [`Error::FeatureNotEnabled`].
        pub fn connect(_descriptor: &PostgresDescriptor) -> Result<Self> {
            Err(not_enabled())
        }

        pub(super) const fn poll_alive(&self) -> bool {
            false
        }
    }

    impl Session for PostgresSession {
        fn backend_name(&self) -> &'static str {
            NAME
        }

        fn execute(&self, _sql: &str, _params: &[Value]) -> Result<StatementOutput> {
            Err(not_enabled())
        }

        fn execute_batch(&self, _sql: &str) -> Result<()> {
            Err(not_enabled())
        }

        fn commit(&self) -> Result<()> {
            Err(not_enabled())
        }

        fn rollback(&self) -> Result<()> {
            Err(not_enabled())
        }

        fn in_transaction(&self) -> bool {
            false
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            true
        }
    }
}

#[cfg(not(feature = "postgres"))]
pub use stub::PostgresSession;
