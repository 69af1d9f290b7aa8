//! `SQLite` Database Engine Implementation
//!
//! This module implements the `DatabaseEngine` trait for `SQLite` databases.
//!
//! # Features
//! - File-based database connections
//! - Step-wise streaming: a blocking producer owns the connection and steps the
//!   prepared statement at most `batch_size` times per fetch request
//! - Cancellation through the connection's interrupt handle
//! - Schema introspection via `sqlite_master` and `pragma_table_info`
//!
//! # Implementation Notes
//! - Uses rusqlite (synchronous API) on the blocking thread pool
//! - Queries open the file read-write without creating it; introspection opens it read-only
//! - BLOB data is Base64-encoded for JSON safety
//! - The schema parameter is ignored (`SQLite` has no schemas)

use rusqlite::{Connection, InterruptHandle, OpenFlags, Row};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;

use crate::engine::{
    page_offset, ColumnInfo, ConnectionConfig, ConnectionInfo, DatabaseEngine, DatabaseType,
    Fetch, FetchRequests, JsonRow, PullCursor, RowBatch, RowCursor, SchemaSummary, TableSummary,
    TablePage,
};
use crate::error::{BridgeError, Result};

/// `SQLite` database engine implementation
pub struct SqliteEngine;

impl DatabaseEngine for SqliteEngine {
    async fn validate_connection(config: &ConnectionConfig) -> Result<ConnectionInfo> {
        let path = sqlite_path(config)?;

        run_blocking(move || {
            let conn = open_connection(&path, true)?;

            let version: String =
                conn.query_row("SELECT sqlite_version()", [], |row| row.get(0)).map_err(|e| {
                    BridgeError::connection_failed(format!("Failed to query SQLite version: {e}"))
                })?;

            let db_name = path.file_name().and_then(|n| n.to_str()).map_or_else(
                || path.to_string_lossy().into_owned(),
                std::string::ToString::to_string,
            );

            Ok(ConnectionInfo {
                database_version: version.clone(),
                server_info: format!("SQLite {version}"),
                connected_database: db_name,
                user: "N/A".to_string(), // SQLite has no user concept
            })
        })
        .await
    }

    async fn open_cursor(
        config: &ConnectionConfig,
        sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let path = sqlite_path(config)?;
        let sql = sql.to_string();
        let batch_size = batch_size.max(1);

        let (ready_tx, ready_rx) = oneshot::channel();
        let (requests_tx, requests) = PullCursor::channel();
        let worker = tokio::task::spawn_blocking(move || {
            stream_statement(&path, &sql, batch_size, ready_tx, requests);
        });

        let interrupt = match ready_rx.await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BridgeError::query_failed("SQLite query task stopped before starting")),
        };

        let cursor = PullCursor::new(requests_tx, worker).with_abort(move || interrupt.interrupt());
        Ok(Box::new(cursor))
    }

    /// Attached databases stand in for schemas (`main` for a plain file)
    async fn list_schemas(config: &ConnectionConfig) -> Result<Vec<SchemaSummary>> {
        let path = sqlite_path(config)?;

        run_blocking(move || {
            let conn = open_connection(&path, true)?;
            let mut stmt = conn
                .prepare("SELECT name FROM pragma_database_list WHERE name <> 'temp' ORDER BY seq")
                .map_err(|e| BridgeError::engine_error("sqlite", format!("Failed to list schemas: {e}")))?;

            let schemas = stmt
                .query_map([], |row| Ok(SchemaSummary { name: row.get(0)? }))
                .and_then(Iterator::collect::<rusqlite::Result<Vec<_>>>)
                .map_err(|e| BridgeError::engine_error("sqlite", format!("Failed to list schemas: {e}")))?;

            Ok(schemas)
        })
        .await
    }

    async fn list_tables(
        config: &ConnectionConfig,
        _schema: Option<&str>,
    ) -> Result<Vec<TableSummary>> {
        let path = sqlite_path(config)?;

        run_blocking(move || {
            let conn = open_connection(&path, true)?;
            let mut stmt = conn
                .prepare(
                    "SELECT name, type FROM sqlite_master
                     WHERE type IN ('table', 'view')
                     AND name NOT LIKE 'sqlite_%'
                     ORDER BY name",
                )
                .map_err(|e| BridgeError::engine_error("sqlite", format!("Failed to list tables: {e}")))?;

            let tables = stmt
                .query_map([], |row| {
                    let kind: String = row.get(1)?;
                    Ok(TableSummary {
                        name: row.get(0)?,
                        schema: None,
                        table_type: Some(if kind == "view" { "VIEW" } else { "BASE TABLE" }.to_string()),
                    })
                })
                .and_then(Iterator::collect::<rusqlite::Result<Vec<_>>>)
                .map_err(|e| BridgeError::engine_error("sqlite", format!("Failed to list tables: {e}")))?;

            Ok(tables)
        })
        .await
    }

    async fn describe_table(
        config: &ConnectionConfig,
        _schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        let path = sqlite_path(config)?;
        let table = table.to_string();

        run_blocking(move || {
            let conn = open_connection(&path, true)?;
            introspect_columns(&conn, &table)
        })
        .await
    }

    async fn fetch_table_data(
        config: &ConnectionConfig,
        _schema: Option<&str>,
        table: &str,
        limit: u32,
        page: u32,
    ) -> Result<TablePage> {
        let path = sqlite_path(config)?;
        let table = table.to_string();

        run_blocking(move || {
            let conn = open_connection(&path, true)?;
            let columns = introspect_columns(&conn, &table)?;
            let quoted = quote_ident(&table);

            let total: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {quoted}"), [], |row| row.get(0))
                .map_err(|e| BridgeError::query_failed(format!("Failed to count rows: {e}")))?;

            let sql = format!(
                "SELECT * FROM {quoted} ORDER BY {} LIMIT ?1 OFFSET ?2",
                order_by_clause(&columns)
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| BridgeError::query_failed(format!("Failed to prepare query: {e}")))?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

            let offset = i64::try_from(page_offset(limit, page)).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(rusqlite::params![i64::from(limit), offset], |row| row_to_json(&names, row))
                .and_then(Iterator::collect::<rusqlite::Result<Vec<_>>>)
                .map_err(|e| BridgeError::query_failed(format!("Failed to fetch rows: {e}")))?;

            Ok(TablePage { rows, total: u64::try_from(total).unwrap_or(0), page: page.max(1), limit })
        })
        .await
    }
}

/// Run a closure on the blocking pool
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BridgeError::internal(format!("SQLite task failed: {e}")))?
}

/// Database file from `file`, falling back to `database`
fn sqlite_path(config: &ConnectionConfig) -> Result<PathBuf> {
    if config.engine != DatabaseType::SQLite {
        return Err(BridgeError::invalid_input(format!(
            "Expected SQLite engine, got {}",
            config.engine
        )));
    }

    config
        .file
        .clone()
        .or_else(|| config.database.as_ref().map(PathBuf::from))
        .ok_or_else(|| BridgeError::invalid_input("SQLite requires 'file' parameter"))
}

/// Open `SQLite` connection with appropriate flags
fn open_connection(path: &Path, read_only: bool) -> Result<Connection> {
    let mode = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
    };
    let flags = mode | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    Connection::open_with_flags(path, flags)
        .map_err(|e| BridgeError::connection_failed(format!("Failed to open SQLite database: {e}")))
}

fn fetch_error(e: &rusqlite::Error) -> BridgeError {
    BridgeError::query_failed(e.to_string())
}

/// Blocking producer behind a `SQLite` cursor
fn stream_statement(
    path: &Path,
    sql: &str,
    batch_size: usize,
    ready: oneshot::Sender<Result<InterruptHandle>>,
    mut requests: FetchRequests,
) {
    let conn = match open_connection(path, false) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let interrupt = conn.get_interrupt_handle();

    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = ready.send(Err(BridgeError::query_failed(format!("Failed to prepare query: {e}"))));
            return;
        }
    };
    if ready.send(Ok(interrupt)).is_err() {
        return;
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    if columns.is_empty() {
        let Some(reply) = requests.blocking_next() else {
            return;
        };
        match stmt.execute([]) {
            Ok(n) => {
                let rows_affected = Some(n as u64);
                let _ = reply.send(Ok(Fetch::Exhausted { rows_affected }));
                while let Some(reply) = requests.blocking_next() {
                    let _ = reply.send(Ok(Fetch::Exhausted { rows_affected }));
                }
            }
            Err(e) => {
                let _ = reply.send(Err(fetch_error(&e)));
            }
        }
        return;
    }

    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => {
            if let Some(reply) = requests.blocking_next() {
                let _ = reply.send(Err(fetch_error(&e)));
            }
            return;
        }
    };

    let mut done = false;
    while let Some(reply) = requests.blocking_next() {
        if done {
            let _ = reply.send(Ok(Fetch::Exhausted { rows_affected: None }));
            continue;
        }

        let mut batch = Vec::with_capacity(batch_size);
        let stepped = loop {
            if batch.len() >= batch_size {
                break Ok(());
            }
            match rows.next() {
                Ok(Some(row)) => match row_to_json(&columns, row) {
                    Ok(json) => batch.push(json),
                    Err(e) => break Err(e),
                },
                Ok(None) => {
                    done = true;
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        match stepped {
            Err(e) => {
                let _ = reply.send(Err(fetch_error(&e)));
                return;
            }
            Ok(()) if batch.is_empty() => {
                let _ = reply.send(Ok(Fetch::Exhausted { rows_affected: None }));
            }
            Ok(()) => {
                let _ = reply.send(Ok(Fetch::Batch(RowBatch { columns: columns.clone(), rows: batch })));
            }
        }
    }
}

/// Column metadata via `pragma_table_info`
fn introspect_columns(conn: &Connection, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare("SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)")
        .map_err(|e| {
            BridgeError::engine_error(
                "sqlite",
                format!("Failed to prepare table_info for {table_name}: {e}"),
            )
        })?;

    let columns: Vec<ColumnInfo> = stmt
        .query_map([table_name], |row| {
            Ok(ColumnInfo {
                name: row.get::<_, String>(0)?,
                data_type: row.get::<_, String>(1)?,
                nullable: row.get::<_, i32>(2)? == 0, // notnull column: 0 = nullable, 1 = not null
                default: row.get::<_, Option<String>>(3)?,
                primary_key: row.get::<_, i32>(4)? > 0, // pk column: >0 means part of primary key
            })
        })
        .and_then(Iterator::collect::<rusqlite::Result<Vec<_>>>)
        .map_err(|e| {
            BridgeError::engine_error(
                "sqlite",
                format!("Failed to query columns for {table_name}: {e}"),
            )
        })?;

    if columns.is_empty() {
        return Err(BridgeError::not_found(format!("Table not found: {table_name}")));
    }

    Ok(columns)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Primary-key columns, or every column when the table has no primary key
fn order_by_clause(columns: &[ColumnInfo]) -> String {
    let pk: Vec<&ColumnInfo> = columns.iter().filter(|c| c.primary_key).collect();
    let ordering = if pk.is_empty() { columns.iter().collect() } else { pk };
    ordering.iter().map(|c| quote_ident(&c.name)).collect::<Vec<_>>().join(", ")
}

/// Convert a `SQLite` row to a JSON object keyed by column name
fn row_to_json(column_names: &[String], row: &Row) -> std::result::Result<JsonRow, rusqlite::Error> {
    let mut values = JsonRow::new();
    for (idx, name) in column_names.iter().enumerate() {
        values.insert(name.clone(), sqlite_value_to_json(row, idx)?);
    }
    Ok(values)
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(
    row: &Row,
    idx: usize,
) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    use rusqlite::types::ValueRef;

    let value_ref = row.get_ref(idx)?;

    Ok(match value_ref {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // Handle NaN/Infinity as null
        ValueRef::Text(s) => serde_json::Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}
