//! MySQL Database Engine Implementation
//!
//! This module implements the `DatabaseEngine` trait for MySQL databases (including MariaDB).
//!
//! # Features
//! - Client-server connections via TCP, optionally TLS
//! - Row-by-row streaming from the socket: a producer task owns the connection and
//!   reads at most `batch_size` rows per fetch request
//! - Cancellation via `KILL QUERY <connection id>` issued from a side connection
//! - Schema introspection via information_schema
//! - MySQL and MariaDB version detection
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - Streaming uses the text protocol so any statement can run; values are typed
//!   from the column metadata
//! - Multi-statement input streams the first result set that has columns
//! - DECIMAL stays a string to keep precision
//! - JSON columns are parsed into nested JSON
//! - BLOB data is Base64-encoded for JSON safety

use mysql_async::consts::ColumnType;
use mysql_async::{prelude::*, Conn, Opts, OptsBuilder, Row, SslOpts, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine::{
    page_offset, ColumnInfo, ConnectionConfig, ConnectionInfo, DatabaseEngine, DatabaseType,
    Fetch, FetchRequests, JsonRow, PullCursor, RowBatch, RowCursor, SchemaSummary, TableSummary,
    TablePage,
};
use crate::error::{BridgeError, Result};

/// MySQL database engine implementation
pub struct MySqlEngine;

impl DatabaseEngine for MySqlEngine {
    async fn validate_connection(config: &ConnectionConfig) -> Result<ConnectionInfo> {
        let mut conn = connect(config).await?;

        let row: Row = conn
            .query_first("SELECT VERSION(), COALESCE(DATABASE(), ''), CURRENT_USER()")
            .await
            .map_err(|e| {
                BridgeError::connection_failed(format!("Failed to query MySQL version: {e}"))
            })?
            .ok_or_else(|| BridgeError::connection_failed("No version returned"))?;

        let version_string: String = row
            .get(0)
            .ok_or_else(|| BridgeError::connection_failed("Failed to extract version string"))?;
        let connected_database: String = row.get(1).unwrap_or_default();
        let user: String = row.get(2).unwrap_or_default();

        // Detect MySQL vs MariaDB
        let (database_version, server_info) = parse_mysql_version(&version_string);

        if let Err(e) = conn.disconnect().await {
            debug!(error = %e, "mysql disconnect failed");
        }

        Ok(ConnectionInfo { database_version, server_info, connected_database, user })
    }

    async fn open_cursor(
        config: &ConnectionConfig,
        sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let opts = build_mysql_opts(config)?;
        let conn = connect(config).await?;
        let connection_id = conn.id();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (requests_tx, requests) = PullCursor::channel();
        let worker = tokio::spawn(stream_result(
            conn,
            sql.to_string(),
            batch_size.max(1),
            ready_tx,
            requests,
        ));

        let cursor = PullCursor::new(requests_tx, worker)
            .with_abort(move || kill_in_background(opts, connection_id));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(cursor)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BridgeError::query_failed("MySQL query task stopped before starting")),
        }
    }

    async fn list_schemas(config: &ConnectionConfig) -> Result<Vec<SchemaSummary>> {
        let mut conn = connect(config).await?;

        let query = "SELECT schema_name
                     FROM information_schema.schemata
                     WHERE schema_name NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys')
                     ORDER BY schema_name";

        let names: Vec<String> = conn.query(query).await.map_err(|e| {
            BridgeError::engine_error("mysql", format!("Failed to list schemas: {e}"))
        })?;

        if let Err(e) = conn.disconnect().await {
            debug!(error = %e, "mysql disconnect failed");
        }

        Ok(names.into_iter().map(|name| SchemaSummary { name }).collect())
    }

    async fn list_tables(
        config: &ConnectionConfig,
        schema: Option<&str>,
    ) -> Result<Vec<TableSummary>> {
        let mut conn = connect(config).await?;

        let query = "SELECT table_name, table_schema, table_type
                     FROM information_schema.tables
                     WHERE table_schema = COALESCE(?, DATABASE())
                     ORDER BY table_name";

        let rows: Vec<(String, String, String)> =
            conn.exec(query, (schema,)).await.map_err(|e| {
                BridgeError::engine_error("mysql", format!("Failed to query tables: {e}"))
            })?;

        if let Err(e) = conn.disconnect().await {
            debug!(error = %e, "mysql disconnect failed");
        }

        Ok(rows
            .into_iter()
            .map(|(name, schema, table_type)| TableSummary {
                name,
                schema: Some(schema),
                table_type: Some(table_type),
            })
            .collect())
    }

    async fn describe_table(
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        let mut conn = connect(config).await?;
        let columns = introspect_columns(&mut conn, schema, table).await;
        if let Err(e) = conn.disconnect().await {
            debug!(error = %e, "mysql disconnect failed");
        }
        columns
    }

    async fn fetch_table_data(
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
        limit: u32,
        page: u32,
    ) -> Result<TablePage> {
        let mut conn = connect(config).await?;

        let columns = introspect_columns(&mut conn, schema, table).await?;
        let qualified = match schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
            None => quote_ident(table),
        };
        let order_by = order_by_clause(&columns);

        let total: Option<u64> = conn
            .query_first(format!("SELECT COUNT(*) FROM {qualified}"))
            .await
            .map_err(|e| BridgeError::query_failed(format!("Failed to count rows: {e}")))?;

        let sql = format!("SELECT * FROM {qualified} ORDER BY {order_by} LIMIT ? OFFSET ?");
        let rows: Vec<Row> = conn
            .exec(sql, (u64::from(limit), page_offset(limit, page)))
            .await
            .map_err(|e| BridgeError::query_failed(format!("Failed to fetch rows: {e}")))?;

        if let Err(e) = conn.disconnect().await {
            debug!(error = %e, "mysql disconnect failed");
        }

        let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;
        Ok(TablePage { rows, total: total.unwrap_or(0), page: page.max(1), limit })
    }
}

fn build_mysql_opts(config: &ConnectionConfig) -> Result<Opts> {
    if config.engine != DatabaseType::MySQL {
        return Err(BridgeError::invalid_input(format!(
            "Expected MySQL engine, got {}",
            config.engine
        )));
    }

    let host = config
        .host
        .as_ref()
        .ok_or_else(|| BridgeError::invalid_input("MySQL requires 'host' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| BridgeError::invalid_input("MySQL requires 'user' parameter"))?;

    let mut opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(config.effective_port().unwrap_or(3306))
        .user(Some(user))
        .pass(config.password.as_ref())
        .db_name(config.database.as_ref());

    if config.ssl {
        opts = opts.ssl_opts(Some(SslOpts::default()));
    }

    Ok(opts.into())
}

/// Connect, honouring the configured handshake timeout
async fn connect(config: &ConnectionConfig) -> Result<Conn> {
    let opts = build_mysql_opts(config)?;
    let connecting = Conn::new(opts);

    let connected = match config.connect_timeout() {
        Some(timeout) => tokio::time::timeout(timeout, connecting).await.map_err(|_| {
            BridgeError::connection_failed(format!(
                "Timed out connecting to MySQL after {}ms",
                timeout.as_millis()
            ))
        })?,
        None => connecting.await,
    };

    connected.map_err(|e| BridgeError::connection_failed(format!("Failed to connect to MySQL: {e}")))
}

/// Issue `KILL QUERY` for `connection_id` from a fresh connection, without waiting
fn kill_in_background(opts: Opts, connection_id: u32) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        match Conn::new(opts).await {
            Ok(mut conn) => {
                if let Err(e) = conn.query_drop(format!("KILL QUERY {connection_id}")).await {
                    debug!(error = %e, connection_id, "mysql KILL QUERY failed");
                }
                let _ = conn.disconnect().await;
            }
            Err(e) => debug!(error = %e, "mysql cancel connection failed"),
        }
    });
}

/// Producer task behind a MySQL cursor
///
/// Multi-statement input streams the first result set that has columns. Leading
/// column-less sets (`SET`, `UPDATE`, ...) only add to `rows_affected`; sets after the
/// streamed one are discarded.
async fn stream_result(
    mut conn: Conn,
    sql: String,
    batch_size: usize,
    ready: oneshot::Sender<Result<()>>,
    mut requests: FetchRequests,
) {
    let mut rows_affected = None;

    {
        let mut result = match conn.query_iter(sql).await {
            Ok(result) => result,
            Err(e) => {
                let _ = ready.send(Err(BridgeError::query_failed(format!(
                    "Failed to execute query: {e}"
                ))));
                return;
            }
        };

        let mut skipped: Option<u64> = None;
        while result.columns_ref().is_empty() && !result.is_empty() {
            *skipped.get_or_insert(0) += result.affected_rows();
            if let Err(e) = result.next().await {
                let _ = ready.send(Err(BridgeError::query_failed(format!(
                    "Failed to execute query: {e}"
                ))));
                return;
            }
        }
        if ready.send(Ok(())).is_err() {
            return;
        }

        let columns: Vec<String> =
            result.columns_ref().iter().map(|c| c.name_str().to_string()).collect();

        if columns.is_empty() {
            rows_affected = Some(skipped.unwrap_or_else(|| result.affected_rows()));
        } else {
            loop {
                let Some(reply) = requests.next().await else {
                    // Closed before exhaustion; the abort hook has already killed the query
                    return;
                };

                let mut rows = Vec::with_capacity(batch_size);
                let mut done = false;
                while rows.len() < batch_size {
                    match result.next().await {
                        Ok(Some(row)) => match row_to_json(&row) {
                            Ok(json) => rows.push(json),
                            Err(e) => {
                                let _ = reply.send(Err(e));
                                return;
                            }
                        },
                        Ok(None) => {
                            done = true;
                            break;
                        }
                        Err(e) => {
                            let _ = reply.send(Err(BridgeError::query_failed(e.to_string())));
                            return;
                        }
                    }
                }

                if rows.is_empty() {
                    let _ = reply.send(Ok(Fetch::Exhausted { rows_affected: None }));
                } else {
                    let _ = reply.send(Ok(Fetch::Batch(RowBatch { columns: columns.clone(), rows })));
                }
                if done {
                    break;
                }
            }
        }

        if !result.is_empty() {
            warn!("discarding result sets after the first one with columns");
            if let Err(e) = result.drop_result().await {
                debug!(error = %e, "mysql trailing result set failed");
            }
        }
    }

    if let Err(e) = conn.disconnect().await {
        debug!(error = %e, "mysql disconnect failed");
    }

    while let Some(reply) = requests.next().await {
        let _ = reply.send(Ok(Fetch::Exhausted { rows_affected }));
    }
}

/// Parse MySQL version string to detect MySQL vs MariaDB
fn parse_mysql_version(version_string: &str) -> (String, String) {
    // Example MySQL: "8.0.35"
    // Example MariaDB: "10.11.2-MariaDB"

    if version_string.to_uppercase().contains("MARIADB") {
        let version = version_string.split('-').next().unwrap_or("unknown").to_string();
        let info = format!("MariaDB {version}");
        (version, info)
    } else {
        let version =
            version_string.split_whitespace().next().unwrap_or(version_string).to_string();
        let info = format!("MySQL {version}");
        (version, info)
    }
}

/// Introspect table columns, including primary-key membership
async fn introspect_columns(
    conn: &mut Conn,
    schema: Option<&str>,
    table_name: &str,
) -> Result<Vec<ColumnInfo>> {
    let query = "SELECT column_name, data_type, is_nullable, column_default, column_key
                 FROM information_schema.columns
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?
                 ORDER BY ordinal_position";

    let rows: Vec<Row> = conn.exec(query, (schema, table_name)).await.map_err(|e| {
        BridgeError::engine_error("mysql", format!("Failed to query columns for {table_name}: {e}"))
    })?;

    if rows.is_empty() {
        return Err(BridgeError::not_found(format!("Table not found: {table_name}")));
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row
            .get(0)
            .ok_or_else(|| BridgeError::engine_error("mysql", "Failed to extract column name"))?;
        let data_type: String = row
            .get(1)
            .ok_or_else(|| BridgeError::engine_error("mysql", "Failed to extract data type"))?;
        let is_nullable: String = row.get(2).unwrap_or_default();
        let default: Option<String> = row.get::<Option<String>, _>(3).flatten();
        let column_key: String = row.get(4).unwrap_or_default();

        columns.push(ColumnInfo {
            name,
            data_type,
            nullable: is_nullable == "YES",
            default,
            primary_key: column_key == "PRI",
        });
    }

    Ok(columns)
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Primary-key columns, or every column when the table has no primary key
fn order_by_clause(columns: &[ColumnInfo]) -> String {
    let pk: Vec<&ColumnInfo> = columns.iter().filter(|c| c.primary_key).collect();
    let ordering = if pk.is_empty() { columns.iter().collect() } else { pk };
    ordering.iter().map(|c| quote_ident(&c.name)).collect::<Vec<_>>().join(", ")
}

/// Convert a MySQL row to a JSON object keyed by column name
fn row_to_json(row: &Row) -> Result<JsonRow> {
    let mut map = JsonRow::new();

    for (idx, column) in row.columns_ref().iter().enumerate() {
        map.insert(column.name_str().to_string(), mysql_value_to_json(row, idx)?);
    }

    Ok(map)
}

fn bytes_to_json(bytes: &[u8]) -> serde_json::Value {
    match std::str::from_utf8(bytes) {
        Ok(s) => serde_json::Value::String(s.to_string()),
        Err(_) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

/// Text-protocol value, typed by its column
fn text_value_to_json(column_type: ColumnType, bytes: &[u8]) -> serde_json::Value {
    let text = std::str::from_utf8(bytes).ok();

    let typed = match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text.and_then(|t| {
            t.parse::<i64>()
                .map(serde_json::Value::from)
                .or_else(|_| t.parse::<u64>().map(serde_json::Value::from))
                .ok()
        }),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => text
            .and_then(|t| t.parse::<f64>().ok())
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number),
        ColumnType::MYSQL_TYPE_JSON => text.and_then(|t| serde_json::from_str(t).ok()),
        _ => None,
    };

    typed.unwrap_or_else(|| bytes_to_json(bytes))
}

/// Convert MySQL value to JSON value
fn mysql_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    let value = row
        .as_ref(idx)
        .ok_or_else(|| BridgeError::query_failed(format!("Failed to get value at index {idx}")))?;

    let json_value = match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => text_value_to_json(row.columns_ref()[idx].column_type(), bytes),

        Value::Int(i) => serde_json::Value::from(*i),

        Value::UInt(u) => serde_json::Value::from(*u),

        // NaN/Infinity become null
        Value::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),

        Value::Double(d) => {
            serde_json::Number::from_f64(*d).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }

        Value::Date(year, month, day, hour, minute, second, micro) => serde_json::Value::String(
            format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"),
        ),

        Value::Time(is_negative, days, hours, minutes, seconds, microseconds) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            serde_json::Value::String(format!(
                "{sign}{total_hours}:{minutes:02}:{seconds:02}.{microseconds:06}"
            ))
        }
    };

    Ok(json_value)
}
