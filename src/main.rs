//! Binary entry point for dbkeeper.
//!
//! A small CLI for checking a property file and running ad-hoc statements
//! through the connection manager.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stdout in main binary for CLI output
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dbkeeper::backend::Backend;
use dbkeeper::config::{PROPERTIES_ENV, Properties, resolve_properties_path};
use dbkeeper::manager::global;
use dbkeeper::observability::{self, LoggingConfig};
use dbkeeper::{ConnectionDescriptor, ConnectionManager, Row, Value};
use serde_json::{Map, json};
use std::path::PathBuf;
use std::process::ExitCode;

/// dbkeeper - lazily managed database connections.
#[derive(Parser)]
#[command(name = "dbkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the property file.
    #[arg(short, long, global = true, env = PROPERTIES_ENV)]
    properties: Option<PathBuf>,

    /// Backend to use.
    #[arg(short, long, global = true, value_enum, default_value_t = BackendKind::Embedded)]
    backend: BackendKind,

    #[command(subcommand)]
    command: Commands,
}

/// Selectable backends.
#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// Embedded `SQLite`.
    Embedded,
    /// Networked PostgreSQL.
    Networked,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Connect and report the server time.
    Ping,

    /// Run one statement and print the result as JSON.
    Query {
        /// The SQL statement.
        sql: String,

        /// Commit after the statement.
        #[arg(long)]
        commit: bool,
    },

    /// Validate the property file and print the resolved settings.
    ShowConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = observability::init(&LoggingConfig::from_env(cli.verbose)) {
        eprintln!("warning: logging disabled: {e}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn run(cli: Cli) -> Result<()> {
    let path = resolve_properties_path(cli.properties.as_deref());
    match cli.backend {
        BackendKind::Embedded => {
            let manager = global::embedded(&path);
            dispatch(manager, &cli.command, "SELECT datetime('now') AS server_time")
        },
        BackendKind::Networked => {
            let manager = global::networked(&path);
            dispatch(manager, &cli.command, "SELECT now() AS server_time")
        },
    }
}

fn dispatch<B: Backend>(
    manager: &ConnectionManager<B>,
    command: &Commands,
    ping_sql: &str,
) -> Result<()>
where
    B::Descriptor: Into<ConnectionDescriptor>,
{
    let result = match command {
        Commands::Ping => ping(manager, ping_sql),
        Commands::Query { sql, commit } => query(manager, sql, *commit),
        Commands::ShowConfig => show_config(manager),
    };
    manager.close().context("closing connection")?;
    result
}

fn ping<B: Backend>(manager: &ConnectionManager<B>, sql: &str) -> Result<()> {
    let mut cur = manager.cursor(true)?;
    cur.execute(sql, &[])?;
    let server_time = cur
        .fetch_one()?
        .and_then(|row| row.get_by_name("server_time").cloned())
        .unwrap_or(Value::Null);
    cur.close();

    let report = json!({
        "backend": B::NAME,
        "server_time": server_time,
        "checked_at": chrono::Utc::now().to_rfc3339(),
        "connections_opened": manager.connections_opened(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn row_to_json(row: &Row) -> serde_json::Value {
    let mut object = Map::new();
    for (column, value) in row.iter_named() {
        object.insert(column.to_string(), serde_json::to_value(value).unwrap_or_default());
    }
    serde_json::Value::Object(object)
}

fn query<B: Backend>(manager: &ConnectionManager<B>, sql: &str, commit: bool) -> Result<()> {
    let (mut cur, conn) = manager.cursor_and_connection(true)?;
    cur.execute(sql, &[]).with_context(|| format!("executing {sql}"))?;

    let output = if cur.columns().is_empty() {
        json!({ "rows_affected": cur.row_count() })
    } else {
        let rows: Vec<_> = cur.fetch_all()?.iter().map(row_to_json).collect();
        json!({ "columns": cur.columns(), "rows": rows })
    };
    cur.close();

    if commit {
        conn.commit().context("committing")?;
    } else if conn.in_transaction() {
        conn.rollback().context("rolling back")?;
        eprintln!("note: transaction rolled back; pass --commit to keep changes");
    }

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn show_config<B: Backend>(manager: &ConnectionManager<B>) -> Result<()>
where
    B::Descriptor: Into<ConnectionDescriptor>,
{
    let props = Properties::load(manager.properties_path())?;
    let descriptor: ConnectionDescriptor = manager.backend().build_descriptor(&props)?.into();
    println!("properties: {}", manager.properties_path().display());
    println!("{}", descriptor.summary());
    Ok(())
}
