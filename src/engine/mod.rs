//! Database Engine Traits and Core Types
//!
//! This module defines the core abstractions for database engines.
//! Each engine (`PostgreSQL`, `MySQL`, `SQLite`) implements the `DatabaseEngine` trait,
//! and [`NativeConnector`] dispatches the bridge's [`Connector`] capability set onto them.
//!
//! # Stateless Design
//! All trait methods take `&ConnectionConfig` as input. Introspection calls open,
//! use and close their own connection. Streaming queries open a connection that is
//! owned by the returned [`RowCursor`] until it is closed.
//!
//! # Engine Isolation
//! Each engine implementation is completely independent.
//! No shared SQL helpers or cross-engine abstractions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

pub mod cursor;

pub use cursor::{Fetch, FetchReply, FetchRequests, PullCursor, RowCursor, VecCursor};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "mysql")]
use mysql::MySqlEngine;
#[cfg(feature = "postgres")]
use postgres::PostgresEngine;
#[cfg(feature = "sqlite")]
use sqlite::SqliteEngine;

/// One result row, keyed by column name
pub type JsonRow = serde_json::Map<String, serde_json::Value>;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    #[default]
    Postgres,
    /// `MySQL` database (includes `MariaDB`)
    MySQL,
    /// `SQLite` database
    SQLite,
}

impl DatabaseType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }

    /// Port used when a config does not name one
    #[must_use]
    pub const fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySQL => Some(3306),
            Self::SQLite => None,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySQL),
            "sqlite" | "sqlite3" => Ok(Self::SQLite),
            other => Err(BridgeError::invalid_input(format!("Unsupported database type: {other}"))),
        }
    }
}

impl TryFrom<String> for DatabaseType {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Connection configuration for database engines
///
/// Passed by value per call and never persisted by the executor.
/// Fields are engine-specific (e.g., `file` only applies to `SQLite`).
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Database engine type (defaults to postgres)
    #[serde(default, alias = "type")]
    pub engine: DatabaseType,

    /// Hostname (for postgres/mysql)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port number (for postgres/mysql)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username (for postgres/mysql)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password (for postgres/mysql)
    /// WARNING: Sensitive data, do not log or include in error messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Database name (for postgres/mysql)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Database file path (for sqlite)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Request an encrypted connection
    #[serde(default)]
    pub ssl: bool,

    /// Handshake timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("file", &self.file)
            .field("ssl", &self.ssl)
            .finish()
    }
}

impl ConnectionConfig {
    /// Create a new `PostgreSQL` connection config
    #[must_use]
    pub fn postgres(host: String, port: u16, user: String, password: String, database: String) -> Self {
        Self {
            engine: DatabaseType::Postgres,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            database: Some(database),
            ..Self::default()
        }
    }

    /// Create a new `MySQL` connection config
    #[must_use]
    pub fn mysql(host: String, port: u16, user: String, password: String, database: String) -> Self {
        Self {
            engine: DatabaseType::MySQL,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            database: Some(database),
            ..Self::default()
        }
    }

    /// Create a new `SQLite` connection config
    #[must_use]
    pub fn sqlite(file: PathBuf) -> Self {
        Self { engine: DatabaseType::SQLite, file: Some(file), ..Self::default() }
    }

    /// Port to connect to, falling back to the engine default
    #[must_use]
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.engine.default_port())
    }

    /// Handshake timeout, if one was requested
    #[must_use]
    pub fn connect_timeout(&self) -> Option<std::time::Duration> {
        self.connect_timeout_ms.map(std::time::Duration::from_millis)
    }

    /// Fill in a handshake timeout when the caller did not ask for one
    #[must_use]
    pub fn with_default_connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        if self.connect_timeout_ms.is_none() {
            self.connect_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        }
        self
    }
}

/// Connection information returned after successful connection validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Database server version string
    pub database_version: String,

    /// Server information (implementation-specific)
    pub server_info: String,

    /// Name of the connected database
    pub connected_database: String,

    /// Connected user name
    pub user: String,
}

/// Link state reported by connection tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Result of a connection test
///
/// Connectivity failures are ordinary results (`ok: false`), never errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub ok: bool,
    pub status: LinkStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<ConnectionInfo>,
}

impl ConnectionStatus {
    #[must_use]
    pub fn connected(info: ConnectionInfo) -> Self {
        Self {
            ok: true,
            status: LinkStatus::Connected,
            message: "Connection successful".to_string(),
            info: Some(info),
        }
    }

    #[must_use]
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self { ok: false, status: LinkStatus::Disconnected, message: message.into(), info: None }
    }
}

/// Schema (namespace) listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub name: String,
}

/// Table listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    /// Table name
    pub name: String,

    /// Schema name (for engines that support schemas)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Table type as reported by the engine (`BASE TABLE`, `VIEW`, ...)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub table_type: Option<String>,
}

/// Column information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    /// Column name
    pub name: String,

    /// Column data type (engine-specific)
    pub data_type: String,

    /// Whether column allows NULL values
    pub nullable: bool,

    /// Default value (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Whether the column is part of the primary key
    pub primary_key: bool,
}

/// One page of table data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePage {
    pub rows: Vec<JsonRow>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// A bounded slice of result rows pulled from a cursor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBatch {
    /// Column names in result order
    pub columns: Vec<String>,

    /// Rows keyed by column name
    pub rows: Vec<JsonRow>,
}

impl RowBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Row offset for a 1-indexed page
#[must_use]
pub fn page_offset(limit: u32, page: u32) -> u64 {
    u64::from(page.max(1) - 1) * u64::from(limit)
}

/// Database engine trait
///
/// All database engines implement this trait.
/// Each method takes a connection config as input.
pub trait DatabaseEngine {
    /// Validate connection and return connection information
    ///
    /// Opens a connection, retrieves server metadata and closes it again.
    fn validate_connection(
        config: &ConnectionConfig,
    ) -> impl std::future::Future<Output = Result<ConnectionInfo>> + Send;

    /// Open a streaming cursor over `sql`
    ///
    /// Connection and prepare failures are reported here, before any batch is pulled.
    /// The returned cursor exclusively owns its connection.
    fn open_cursor(
        config: &ConnectionConfig,
        sql: &str,
        batch_size: usize,
    ) -> impl std::future::Future<Output = Result<Box<dyn RowCursor>>> + Send;

    /// List user schemas, system namespaces excluded
    fn list_schemas(
        config: &ConnectionConfig,
    ) -> impl std::future::Future<Output = Result<Vec<SchemaSummary>>> + Send;

    /// List tables (and views) visible in `schema`, or in the default schema
    fn list_tables(
        config: &ConnectionConfig,
        schema: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<TableSummary>>> + Send;

    /// Describe the columns of one table
    fn describe_table(
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ColumnInfo>>> + Send;

    /// Read one page of a table, ordered by primary key (or every column)
    fn fetch_table_data(
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
        limit: u32,
        page: u32,
    ) -> impl std::future::Future<Output = Result<TablePage>> + Send;
}

/// Connector capability set used by the bridge
///
/// [`NativeConnector`] is the production implementation; tests substitute scripted
/// connectors to drive the streaming protocol deterministically.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Test connectivity. Never fails: unreachable databases yield `ok: false`.
    async fn test_connection(&self, config: &ConnectionConfig) -> ConnectionStatus;

    /// Open a cursor for a streaming query
    async fn open_cursor(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowCursor>>;

    /// List schemas
    async fn list_schemas(&self, config: &ConnectionConfig) -> Result<Vec<SchemaSummary>>;

    /// List tables
    async fn list_tables(
        &self,
        config: &ConnectionConfig,
        schema: Option<&str>,
    ) -> Result<Vec<TableSummary>>;

    /// Describe table columns
    async fn describe_table(
        &self,
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>>;

    /// Paginated table read (1-indexed page)
    async fn fetch_table_data(
        &self,
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
        limit: u32,
        page: u32,
    ) -> Result<TablePage>;
}

/// Connector backed by the native drivers compiled into this build
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeConnector;

#[allow(dead_code)]
fn engine_not_enabled(engine: DatabaseType) -> BridgeError {
    BridgeError::invalid_input(format!(
        "{engine} engine not enabled. Build with --features {engine}"
    ))
}

#[async_trait]
impl Connector for NativeConnector {
    async fn test_connection(&self, config: &ConnectionConfig) -> ConnectionStatus {
        let validated = match config.engine {
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => PostgresEngine::validate_connection(config).await,
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => MySqlEngine::validate_connection(config).await,
            #[cfg(feature = "sqlite")]
            DatabaseType::SQLite => SqliteEngine::validate_connection(config).await,
            #[allow(unreachable_patterns)]
            other => Err(engine_not_enabled(other)),
        };

        match validated {
            Ok(info) => ConnectionStatus::connected(info),
            Err(e) => ConnectionStatus::disconnected(e.message()),
        }
    }

    async fn open_cursor(
        &self,
        config: &ConnectionConfig,
        sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowCursor>> {
        match config.engine {
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => PostgresEngine::open_cursor(config, sql, batch_size).await,
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => MySqlEngine::open_cursor(config, sql, batch_size).await,
            #[cfg(feature = "sqlite")]
            DatabaseType::SQLite => SqliteEngine::open_cursor(config, sql, batch_size).await,
            #[allow(unreachable_patterns)]
            other => Err(engine_not_enabled(other)),
        }
    }

    async fn list_schemas(&self, config: &ConnectionConfig) -> Result<Vec<SchemaSummary>> {
        match config.engine {
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => PostgresEngine::list_schemas(config).await,
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => MySqlEngine::list_schemas(config).await,
            #[cfg(feature = "sqlite")]
            DatabaseType::SQLite => SqliteEngine::list_schemas(config).await,
            #[allow(unreachable_patterns)]
            other => Err(engine_not_enabled(other)),
        }
    }

    async fn list_tables(
        &self,
        config: &ConnectionConfig,
        schema: Option<&str>,
    ) -> Result<Vec<TableSummary>> {
        match config.engine {
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => PostgresEngine::list_tables(config, schema).await,
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => MySqlEngine::list_tables(config, schema).await,
            #[cfg(feature = "sqlite")]
            DatabaseType::SQLite => SqliteEngine::list_tables(config, schema).await,
            #[allow(unreachable_patterns)]
            other => Err(engine_not_enabled(other)),
        }
    }

    async fn describe_table(
        &self,
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        match config.engine {
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => PostgresEngine::describe_table(config, schema, table).await,
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => MySqlEngine::describe_table(config, schema, table).await,
            #[cfg(feature = "sqlite")]
            DatabaseType::SQLite => SqliteEngine::describe_table(config, schema, table).await,
            #[allow(unreachable_patterns)]
            other => Err(engine_not_enabled(other)),
        }
    }

    async fn fetch_table_data(
        &self,
        config: &ConnectionConfig,
        schema: Option<&str>,
        table: &str,
        limit: u32,
        page: u32,
    ) -> Result<TablePage> {
        match config.engine {
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => {
                PostgresEngine::fetch_table_data(config, schema, table, limit, page).await
            }
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => {
                MySqlEngine::fetch_table_data(config, schema, table, limit, page).await
            }
            #[cfg(feature = "sqlite")]
            DatabaseType::SQLite => {
                SqliteEngine::fetch_table_data(config, schema, table, limit, page).await
            }
            #[allow(unreachable_patterns)]
            other => Err(engine_not_enabled(other)),
        }
    }
}
