//! `PostgreSQL` Database Engine Implementation
//!
//! This module implements the `DatabaseEngine` trait for `PostgreSQL` databases.
//!
//! # Features
//! - Client-server connections via TCP, optionally TLS (rustls + native roots)
//! - Streaming through a bound portal inside a transaction: each fetch executes the
//!   portal for at most `batch_size` rows, so nothing is buffered ahead of the consumer
//! - Server-side cancellation through the protocol cancel request
//! - Schema introspection via `information_schema`
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` (async driver, requires tokio runtime)
//! - JSON/JSONB preserved as nested JSON
//! - NUMERIC decoded to its exact decimal string
//! - BYTEA data is Base64-encoded for JSON safety
//! - Statements that return rows are committed once the portal is drained; abandoned
//!   cursors roll back
//! - Statements without result columns run outside any transaction block

use rustls::{ClientConfig, RootCertStore};
use std::error::Error as StdError;
use std::sync::Arc;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{CancelToken, Client, Config, NoTls, Row, Statement};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::engine::{
    page_offset, ColumnInfo, ConnectionConfig, ConnectionInfo, DatabaseEngine, DatabaseType,
    Fetch, FetchRequests, JsonRow, PullCursor, RowBatch, RowCursor, SchemaSummary, TableSummary,
    TablePage,
};
use crate::error::{BridgeError, Result};

/// `PostgreSQL` database engine implementation
pub struct PostgresEngine;

impl DatabaseEngine for PostgresEngine {
    async fn validate_connection(config: &ConnectionConfig) -> Result<ConnectionInfo> {
        let (client, _tls) = connect(config).await?;

        let row = client
            .query_one("SELECT version(), current_database()::text, current_user::text", &[])
            .await
            .map_err(|e| {
                BridgeError::connection_failed(format!("Failed to query PostgreSQL version: {e}"))
            })?;

        let version_string: String = row.get(0);

        // "PostgreSQL 15.3 on x86_64..." -> "15.3"
        let database_version =
            version_string.split_whitespace().nth(1).unwrap_or("unknown").to_string();

        Ok(ConnectionInfo {
            database_version,
            server_info: version_string,
            connected_database: row.get(1),
            user: row.get(2),
        })
    }

    async fn open_cursor(
        config: &ConnectionConfig,
        sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let (client, tls) = connect(config).await?;
        let cancel_token = client.cancel_token();

        let statement = client
            .prepare(sql)
            .await
            .map_err(|e| BridgeError::query_failed(format!("Failed to prepare query: {}", db_error(&e))))?;

        let (requests_tx, requests) = PullCursor::channel();
        let worker = tokio::spawn(stream_portal(client, statement, batch_size.max(1), requests));

        let cursor = PullCursor::new(requests_tx, worker)
            .with_abort(move || cancel_in_background(cancel_token, tls));
        Ok(Box::new(cursor))
    }

    async fn list_schemas(config: &ConnectionConfig) -> Result<Vec<SchemaSummary>> {
        let (client, _tls) = connect(config).await?;

        let query = "
            SELECT nspname::text
            FROM pg_namespace
            WHERE nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
              AND nspname NOT LIKE 'pg_temp_%'
              AND nspname NOT LIKE 'pg_toast_temp_%'
            ORDER BY nspname";

        let rows = client.query(query, &[]).await.map_err(|e| {
            BridgeError::engine_error("postgres", format!("Failed to list schemas: {}", db_error(&e)))
        })?;

        Ok(rows.iter().map(|row| SchemaSummary { name: row.get(0) }).collect())
    }

    async fn list_tables(
        config: &ConnectionConfig,
        schema: Option<&str>,
    ) -> Result<Vec<TableSummary>> {
        let (client, _tls) = connect(config).await?;
        let schema = determine_target_schema(&client, schema).await?;

        let query = "
            SELECT table_name::text, table_schema::text, table_type::text
            FROM information_schema.tables
            WHERE table_schema = $1
            ORDER BY table_name";

        let rows = client.query(query, &[&schema]).await.map_err(|e| {
            BridgeError::engine_error(
                "postgres",
                format!("Failed to list tables in schema '{schema}': {}", db_error(&e)),
            )
        })?;

        Ok(rows
            .iter()
            .map(|row| TableSummary {
                name: row.get(0),
                schema: Some(row.get(1)),
                table_type: Some(row.get(2)),
            })
            .collect())
    }

    async fn describe_table(
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        let (client, _tls) = connect(config).await?;
        let schema = determine_target_schema(&client, schema).await?;
        introspect_columns(&client, &schema, table).await
    }

    async fn fetch_table_data(
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
        limit: u32,
        page: u32,
    ) -> Result<TablePage> {
        let (client, _tls) = connect(config).await?;
        let schema = determine_target_schema(&client, schema).await?;

        let columns = introspect_columns(&client, &schema, table).await?;
        let qualified = format!("{}.{}", quote_ident(&schema), quote_ident(table));
        let order_by = order_by_clause(&columns);

        let count_sql = format!("SELECT COUNT(*) FROM {qualified}");
        let total_row = client
            .query_one(count_sql.as_str(), &[])
            .await
            .map_err(|e| BridgeError::query_failed(format!("Failed to count rows: {}", db_error(&e))))?;
        let total: i64 = total_row.get(0);

        let offset = i64::try_from(page_offset(limit, page)).unwrap_or(i64::MAX);
        let sql = format!("SELECT * FROM {qualified} ORDER BY {order_by} LIMIT $1 OFFSET $2");
        let rows = client
            .query(sql.as_str(), &[&i64::from(limit), &offset])
            .await
            .map_err(|e| BridgeError::query_failed(format!("Failed to fetch rows: {}", db_error(&e))))?;

        let rows = rows
            .iter()
            .map(|row| {
                let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
                row_to_json(&names, row)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TablePage { rows, total: u64::try_from(total).unwrap_or(0), page: page.max(1), limit })
    }
}

/// TLS mode a client was opened with; cancel requests must reuse it
#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

fn build_pg_config(config: &ConnectionConfig) -> Result<Config> {
    if config.engine != DatabaseType::Postgres {
        return Err(BridgeError::invalid_input(format!(
            "Expected PostgreSQL engine, got {}",
            config.engine
        )));
    }

    let host = config
        .host
        .as_ref()
        .ok_or_else(|| BridgeError::invalid_input("PostgreSQL requires 'host' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| BridgeError::invalid_input("PostgreSQL requires 'user' parameter"))?;

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| BridgeError::invalid_input("PostgreSQL requires 'database' parameter"))?;

    let mut pg_config = Config::new();
    pg_config
        .host(host)
        .port(config.effective_port().unwrap_or(5432))
        .user(user)
        .dbname(database)
        .application_name("querybridge");

    if let Some(password) = &config.password {
        pg_config.password(password);
    }
    if let Some(timeout) = config.connect_timeout() {
        pg_config.connect_timeout(timeout);
    }

    Ok(pg_config)
}

fn build_tls_connector() -> Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        warn!(error = %err, "failed to load a native root certificate");
    }
    for cert in loaded.certs {
        if let Err(e) = roots.add(cert) {
            debug!(error = %e, "skipping unusable root certificate");
        }
    }
    if roots.is_empty() {
        return Err(BridgeError::connection_failed("No root certificates available for TLS"));
    }

    let tls_config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| BridgeError::connection_failed(format!("Invalid TLS configuration: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

    Ok(MakeRustlsConnect::new(tls_config))
}

/// Connect and spawn the connection driver task
async fn connect(config: &ConnectionConfig) -> Result<(Client, PgTls)> {
    let pg_config = build_pg_config(config)?;

    // Connection errors are not logged to prevent credential leakage
    if config.ssl {
        let tls = build_tls_connector()?;
        let (client, connection) = pg_config.connect(tls.clone()).await.map_err(|e| {
            BridgeError::connection_failed(format!("Failed to connect to PostgreSQL: {e}"))
        })?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        Ok((client, PgTls::Rustls(tls)))
    } else {
        let (client, connection) = pg_config.connect(NoTls).await.map_err(|e| {
            BridgeError::connection_failed(format!("Failed to connect to PostgreSQL: {e}"))
        })?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        Ok((client, PgTls::None))
    }
}

/// Fire a protocol-level cancel request without waiting for it
fn cancel_in_background(token: CancelToken, tls: PgTls) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        let result = match tls {
            PgTls::None => token.cancel_query(NoTls).await,
            PgTls::Rustls(tls) => token.cancel_query(tls).await,
        };
        if let Err(e) = result {
            debug!(error = %e, "postgres cancel request failed");
        }
    });
}

/// Server message for database errors, driver message otherwise
fn db_error(e: &tokio_postgres::Error) -> String {
    e.as_db_error().map_or_else(|| e.to_string(), |db| db.message().to_string())
}

fn fetch_error(e: &tokio_postgres::Error) -> BridgeError {
    BridgeError::query_failed(db_error(e))
}

/// Producer task behind a `PostgreSQL` cursor
async fn stream_portal(
    mut client: Client,
    statement: Statement,
    batch_size: usize,
    mut requests: FetchRequests,
) {
    let columns: Vec<String> = statement.columns().iter().map(|c| c.name().to_string()).collect();

    // VACUUM, CREATE DATABASE and friends refuse to run inside a transaction block
    if columns.is_empty() {
        let Some(reply) = requests.next().await else {
            return;
        };
        let outcome = client
            .execute(&statement, &[])
            .await
            .map(|affected| Fetch::Exhausted { rows_affected: Some(affected) })
            .map_err(|e| fetch_error(&e));
        let _ = reply.send(outcome);
        return;
    }

    let txn = match client.transaction().await {
        Ok(txn) => txn,
        Err(e) => {
            if let Some(reply) = requests.next().await {
                let _ = reply.send(Err(fetch_error(&e)));
            }
            return;
        }
    };

    let portal = match txn.bind(&statement, &[]).await {
        Ok(portal) => portal,
        Err(e) => {
            if let Some(reply) = requests.next().await {
                let _ = reply.send(Err(fetch_error(&e)));
            }
            return;
        }
    };
    let max_rows = i32::try_from(batch_size).unwrap_or(i32::MAX);

    let (reply, tail) = loop {
        let Some(reply) = requests.next().await else {
            // Closed before exhaustion: dropping the transaction rolls back
            return;
        };
        match txn.query_portal(&portal, max_rows).await {
            Ok(rows) if rows.len() < batch_size => break (reply, rows),
            Ok(rows) => {
                let _ = reply.send(rows_to_batch(&columns, &rows).map(Fetch::Batch));
            }
            Err(e) => {
                let _ = reply.send(Err(fetch_error(&e)));
                return;
            }
        }
    };

    drop(portal);
    if let Err(e) = txn.commit().await {
        let _ = reply.send(Err(fetch_error(&e)));
        return;
    }

    if tail.is_empty() {
        let _ = reply.send(Ok(Fetch::Exhausted { rows_affected: None }));
        return;
    }
    let _ = reply.send(rows_to_batch(&columns, &tail).map(Fetch::Batch));
    while let Some(reply) = requests.next().await {
        let _ = reply.send(Ok(Fetch::Exhausted { rows_affected: None }));
    }
}

fn rows_to_batch(columns: &[String], rows: &[Row]) -> Result<RowBatch> {
    let rows = rows.iter().map(|row| row_to_json(columns, row)).collect::<Result<Vec<_>>>()?;
    Ok(RowBatch { columns: columns.to_vec(), rows })
}

/// Determine target schema (explicit or the session's current schema)
async fn determine_target_schema(client: &Client, schema_filter: Option<&str>) -> Result<String> {
    if let Some(schema) = schema_filter {
        return Ok(schema.to_string());
    }

    let row = client.query_one("SELECT current_schema()::text", &[]).await.map_err(|e| {
        BridgeError::engine_error("postgres", format!("Failed to query current schema: {e}"))
    })?;

    Ok(row.get(0))
}

/// Column metadata with primary-key membership
async fn introspect_columns(
    client: &Client,
    schema: &str,
    table_name: &str,
) -> Result<Vec<ColumnInfo>> {
    let query = "
        SELECT c.column_name::text, c.data_type::text, c.is_nullable::text, c.column_default::text,
               EXISTS (
                   SELECT 1
                   FROM information_schema.table_constraints tc
                   JOIN information_schema.key_column_usage kcu
                     ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                   WHERE tc.constraint_type = 'PRIMARY KEY'
                     AND tc.table_schema = c.table_schema
                     AND tc.table_name = c.table_name
                     AND kcu.column_name = c.column_name
               ) AS is_primary
        FROM information_schema.columns c
        WHERE c.table_schema = $1 AND c.table_name = $2
        ORDER BY c.ordinal_position";

    let rows = client.query(query, &[&schema, &table_name]).await.map_err(|e| {
        BridgeError::engine_error(
            "postgres",
            format!("Failed to query columns for {schema}.{table_name}: {}", db_error(&e)),
        )
    })?;

    if rows.is_empty() {
        return Err(BridgeError::not_found(format!("Table not found: {schema}.{table_name}")));
    }

    Ok(rows
        .iter()
        .map(|row| {
            let is_nullable: String = row.get(2);
            ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                nullable: is_nullable == "YES",
                default: row.get(3),
                primary_key: row.get(4),
            }
        })
        .collect())
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

/// Convert a `PostgreSQL` row to a JSON object keyed by column name
fn row_to_json(column_names: &[String], row: &Row) -> Result<JsonRow> {
    let mut values = JsonRow::new();
    for (idx, name) in column_names.iter().enumerate() {
        values.insert(name.clone(), postgres_value_to_json(row, idx)?);
    }
    Ok(values)
}

fn read_error(row: &Row, idx: usize, e: &tokio_postgres::Error) -> BridgeError {
    let column = &row.columns()[idx];
    BridgeError::query_failed(format!(
        "Failed to read column '{}' ({}): {e}",
        column.name(),
        column.type_().name()
    ))
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    use base64::Engine;
    use serde_json::Value;

    macro_rules! get {
        ($ty:ty) => {
            row.try_get::<_, Option<$ty>>(idx).map_err(|e| read_error(row, idx, &e))?
        };
    }

    let col_type = row.columns()[idx].type_();

    let value = match *col_type {
        Type::BOOL => get!(bool).map(Value::Bool),

        Type::CHAR => get!(i8).map(Value::from),
        Type::INT2 => get!(i16).map(Value::from),
        Type::INT4 => get!(i32).map(Value::from),
        Type::INT8 => get!(i64).map(Value::from),
        Type::OID => get!(u32).map(Value::from),

        // NaN/Infinity become null
        Type::FLOAT4 => get!(f32)
            .and_then(|v| serde_json::Number::from_f64(f64::from(v)))
            .map(Value::Number),
        Type::FLOAT8 => get!(f64).and_then(serde_json::Number::from_f64).map(Value::Number),

        Type::NUMERIC => get!(PgNumeric).map(|n| Value::String(n.0)),

        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => get!(String).map(Value::String),

        Type::JSON | Type::JSONB => get!(Value),

        Type::BYTEA => get!(Vec<u8>)
            .map(|v| Value::String(base64::engine::general_purpose::STANDARD.encode(v))),

        Type::TIMESTAMP => get!(chrono::NaiveDateTime)
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => get!(chrono::DateTime<chrono::Utc>).map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => get!(chrono::NaiveDate).map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
        Type::TIME => get!(chrono::NaiveTime).map(|v| Value::String(v.format("%H:%M:%S%.f").to_string())),

        Type::UUID => get!(uuid::Uuid).map(|v| Value::String(v.to_string())),

        Type::BOOL_ARRAY => get!(Vec<Option<bool>>).map(Value::from),
        Type::INT2_ARRAY => get!(Vec<Option<i16>>).map(Value::from),
        Type::INT4_ARRAY => get!(Vec<Option<i32>>).map(Value::from),
        Type::INT8_ARRAY => get!(Vec<Option<i64>>).map(Value::from),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get!(Vec<Option<String>>).map(Value::from),

        // Enums, citext, domains over text and anything else: text when it decodes as UTF-8
        _ => get!(AnyText).map(|v| Value::String(v.0)),
    };

    Ok(value.unwrap_or(Value::Null))
}

type FromSqlError = Box<dyn StdError + Sync + Send>;

/// Exact decimal string for a binary NUMERIC value
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, FromSqlError> {
        decode_numeric(raw).map(Self).ok_or_else(|| "invalid NUMERIC payload".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Fallback for types without a dedicated mapping
struct AnyText(String);

impl<'a> FromSql<'a> for AnyText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, FromSqlError> {
        use base64::Engine;
        Ok(Self(match std::str::from_utf8(raw) {
            Ok(text) => text.to_string(),
            Err(_) => base64::engine::general_purpose::STANDARD.encode(raw),
        }))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Decode the binary NUMERIC wire format (base-10000 digit groups)
fn decode_numeric(raw: &[u8]) -> Option<String> {
    use std::fmt::Write;

    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;
    const POS_INF: u16 = 0xD000;
    const NEG_INF: u16 = 0xF000;

    let word = |i: usize| raw.get(i * 2..i * 2 + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));

    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(1)? as i16);
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);

    match sign {
        NAN => return Some("NaN".to_string()),
        POS_INF => return Some("Infinity".to_string()),
        NEG_INF => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digits: Vec<u16> = (0..ndigits).map(|i| word(4 + i)).collect::<Option<_>>()?;
    let group = |idx: i32| usize::try_from(idx).ok().and_then(|i| digits.get(i).copied()).unwrap_or(0);

    let mut out = String::new();
    if sign == NEGATIVE {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for idx in 0..=weight {
            let _ = if idx == 0 { write!(out, "{}", group(idx)) } else { write!(out, "{:04}", group(idx)) };
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", group(idx));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Some(out)
}
