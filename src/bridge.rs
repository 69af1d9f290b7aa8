//! RPC Dispatcher
//!
//! Owns the process state (sessions, database registry, connector, output writer) and
//! maps each request to a handler through the static [`Method`] table.
//!
//! # Protocol
//!
//! - Each request is a single line of JSON and is handled on its own task, so a slow
//!   handler (connect, introspection) never delays `query.cancel`
//! - Each response is a single line of JSON echoing the request `id`
//! - Streaming results arrive as notifications, written through the same [`FrameWriter`]
//!
//! On EOF every active query is cancelled first. In-flight requests and queries then
//! share one grace period, and [`Bridge::serve`] returns when it runs out even if some
//! handler is still stuck (for example in a connect to an unreachable host).

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::engine::{ConnectionConfig, Connector};
use crate::error::{BridgeError, Result};
use crate::executor::{QueryExecutor, QueryRequest};
use crate::protocol::{notify, Notification, ReadyParams, Request, Response};
use crate::registry::{DatabasePayload, DatabaseRegistry};
use crate::session::SessionRegistry;
use crate::transport::{Frame, FrameReader, FrameWriter};

/// Every method the bridge answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    HealthPing,
    ConnectionTest,
    CreateSession,
    DestroySession,
    RunQuery,
    CancelQuery,
    AddDatabase,
    ListDatabases,
    GetDatabase,
    UpdateDatabase,
    DeleteDatabase,
    ListSchemas,
    ListTables,
    DescribeTable,
    FetchTableData,
    ConnectTest,
}

impl Method {
    pub const ALL: [Self; 17] = [
        Self::Ping,
        Self::HealthPing,
        Self::ConnectionTest,
        Self::CreateSession,
        Self::DestroySession,
        Self::RunQuery,
        Self::CancelQuery,
        Self::AddDatabase,
        Self::ListDatabases,
        Self::GetDatabase,
        Self::UpdateDatabase,
        Self::DeleteDatabase,
        Self::ListSchemas,
        Self::ListTables,
        Self::DescribeTable,
        Self::FetchTableData,
        Self::ConnectTest,
    ];

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::HealthPing => "health.ping",
            Self::ConnectionTest => "connection.test",
            Self::CreateSession => "query.createSession",
            Self::DestroySession => "query.destroySession",
            Self::RunQuery => "query.run",
            Self::CancelQuery => "query.cancel",
            Self::AddDatabase => "db.add",
            Self::ListDatabases => "db.list",
            Self::GetDatabase => "db.get",
            Self::UpdateDatabase => "db.update",
            Self::DeleteDatabase => "db.delete",
            Self::ListSchemas => "db.listSchemas",
            Self::ListTables => "db.listTables",
            Self::DescribeTable => "db.describeTable",
            Self::FetchTableData => "db.fetchTableData",
            Self::ConnectTest => "db.connectTest",
        }
    }
}

impl FromStr for Method {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "query.fetchTableData" {
            return Ok(Self::FetchTableData);
        }
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| BridgeError::UnknownMethod(s.to_string()))
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Request parameters
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunParams {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    connection: Option<ConnectionConfig>,
    #[serde(default)]
    database_id: Option<String>,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    batch_size: Option<i64>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionParams {
    #[serde(default, alias = "connection")]
    config: Option<ConnectionConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetParams {
    #[serde(default, alias = "dbId", alias = "databaseId")]
    id: Option<String>,
    #[serde(default)]
    connection: Option<ConnectionConfig>,
    #[serde(default, alias = "schemaName")]
    schema: Option<String>,
    #[serde(default, alias = "tableName")]
    table: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    page: Option<u32>,
}

impl TargetParams {
    fn table(&self) -> Result<&str> {
        self.table
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| BridgeError::invalid_input("Missing table"))
    }

    fn schema(&self) -> Option<&str> {
        self.schema.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct IdParams {
    #[serde(default)]
    id: Option<String>,
}

const DEFAULT_PAGE_LIMIT: u32 = 100;

/// Decode params into `T`, treating absent params as `{}`
fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T> {
    let value = if params.is_null() { json!({}) } else { params.clone() };
    serde_json::from_value(value).map_err(|e| BridgeError::invalid_input(format!("Invalid params: {e}")))
}

fn required(value: Option<String>, message: &str) -> Result<String> {
    value.filter(|v| !v.trim().is_empty()).ok_or_else(|| BridgeError::invalid_input(message))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

// ============================================================================
// Bridge
// ============================================================================

/// Bridge process state
pub struct Bridge {
    sessions: Arc<SessionRegistry>,
    registry: DatabaseRegistry,
    connector: Arc<dyn Connector>,
    executor: QueryExecutor,
    writer: FrameWriter,
    config: BridgeConfig,
    started: Instant,
}

impl Bridge {
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        registry: DatabaseRegistry,
        connector: Arc<dyn Connector>,
        writer: FrameWriter,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let executor =
            QueryExecutor::new(Arc::clone(&sessions), Arc::clone(&connector), writer.clone(), &config);
        Self {
            sessions,
            registry,
            connector,
            executor,
            writer,
            config,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    #[must_use]
    pub fn registry(&self) -> &DatabaseRegistry {
        &self.registry
    }

    /// Answer one request
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let outcome = match request.method.parse::<Method>() {
            Ok(method) => {
                debug!(method = %method, "request");
                self.dispatch(method, request.params()).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => Response::success(id, result),
            Err(e) => {
                match &e {
                    BridgeError::Internal(_) | BridgeError::ConfigError(_) => {
                        error!(method = %request.method, error = %e, "request failed");
                    }
                    _ => debug!(method = %request.method, error = %e, "request rejected"),
                }
                Response::failure(id, &e)
            }
        }
    }

    async fn dispatch(&self, method: Method, params: &Value) -> Result<Value> {
        match method {
            Method::Ping => Ok(json!({ "msg": "pong", "echo": params })),
            Method::HealthPing => Ok(self.health()),
            Method::ConnectionTest => {
                let p: ConnectionParams = parse_params(params)?;
                let config = p.config.ok_or_else(|| BridgeError::invalid_input("Missing config"))?;
                let config = config.with_default_connect_timeout(self.config.connect_timeout);
                to_value(&self.connector.test_connection(&config).await)
            }
            Method::CreateSession => Ok(json!({ "sessionId": self.sessions.create_session() })),
            Method::DestroySession => {
                let p: SessionParams = parse_params(params)?;
                let session_id = required(p.session_id, "Missing sessionId")?;
                self.sessions.destroy_session(&session_id)?;
                Ok(json!({ "ok": true }))
            }
            Method::RunQuery => self.run_query(parse_params(params)?).await,
            Method::CancelQuery => {
                let p: SessionParams = parse_params(params)?;
                let session_id = required(p.session_id, "Missing sessionId")?;
                let outcome = self.sessions.cancel(&session_id)?;
                info!(session_id = %session_id, outcome = ?outcome, "query cancel requested");
                Ok(json!({ "ok": true, "cancelled": outcome.cancelled() }))
            }
            Method::AddDatabase => {
                let payload: DatabasePayload = parse_params(params)?;
                to_value(&self.registry.add_database(payload)?)
            }
            Method::ListDatabases => to_value(&self.registry.list_databases()),
            Method::GetDatabase => {
                let p: IdParams = parse_params(params)?;
                to_value(&self.registry.get_database(p.id.as_deref().unwrap_or_default())?)
            }
            Method::UpdateDatabase => {
                let p: IdParams = parse_params(params)?;
                let patch: DatabasePayload = parse_params(params)?;
                to_value(&self.registry.update_database(p.id.as_deref().unwrap_or_default(), patch)?)
            }
            Method::DeleteDatabase => {
                let p: IdParams = parse_params(params)?;
                self.registry.delete_database(p.id.as_deref().unwrap_or_default())?;
                Ok(json!({ "ok": true }))
            }
            Method::ListSchemas => {
                let p: TargetParams = parse_params(params)?;
                let config = self.resolve_target(&p)?;
                to_value(&self.connector.list_schemas(&config).await?)
            }
            Method::ListTables => {
                let p: TargetParams = parse_params(params)?;
                let config = self.resolve_target(&p)?;
                to_value(&self.connector.list_tables(&config, p.schema()).await?)
            }
            Method::DescribeTable => {
                let p: TargetParams = parse_params(params)?;
                let config = self.resolve_target(&p)?;
                to_value(&self.connector.describe_table(&config, p.schema(), p.table()?).await?)
            }
            Method::FetchTableData => {
                let p: TargetParams = parse_params(params)?;
                let config = self.resolve_target(&p)?;
                let limit = p.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1);
                let page = p.page.unwrap_or(1).max(1);
                let data = self
                    .connector
                    .fetch_table_data(&config, p.schema(), p.table()?, limit, page)
                    .await?;
                to_value(&data)
            }
            Method::ConnectTest => {
                let p: TargetParams = parse_params(params)?;
                let config = self.resolve_target(&p)?;
                to_value(&self.connector.test_connection(&config).await)
            }
        }
    }

    fn health(&self) -> Value {
        json!({
            "uptimeSec": self.started.elapsed().as_secs(),
            "pid": std::process::id(),
            "sessions": self.sessions.session_count(),
            "activeQueries": self.sessions.active_query_count(),
        })
    }

    /// Inline `connection` wins over a registered `id`
    fn resolve_target(&self, p: &TargetParams) -> Result<ConnectionConfig> {
        let config = match &p.connection {
            Some(config) => config.clone(),
            None => self.registry.get_database_connection(p.id.as_deref().unwrap_or_default())?,
        };
        Ok(config.with_default_connect_timeout(self.config.connect_timeout))
    }

    async fn run_query(&self, p: RunParams) -> Result<Value> {
        let session_id = required(p.session_id, "Missing sessionId")?;
        let sql = required(p.sql, "Missing sql")?;
        let connection = match (p.connection, p.database_id.filter(|id| !id.trim().is_empty())) {
            (Some(config), _) => config,
            (None, Some(id)) => self.registry.get_database_connection(&id)?,
            (None, None) => return Err(BridgeError::invalid_input("Missing connection or databaseId")),
        };

        let request = QueryRequest {
            session_id,
            connection: connection.with_default_connect_timeout(self.config.connect_timeout),
            sql,
            batch_size: self.config.batch_size_for(p.batch_size),
            fetch_timeout: self.config.fetch_timeout_for(p.timeout_ms),
        };
        let task = self.executor.start(request).await?;

        Ok(json!({ "ok": true, "sessionId": task.session_id, "queryId": task.query_id }))
    }

    /// Serve requests from `reader` until EOF, then shut down
    pub async fn serve<R>(self: Arc<Self>, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let ready = ReadyParams { pid: std::process::id(), version: env!("CARGO_PKG_VERSION").to_string() };
        self.writer.send(&Notification::new(notify::BRIDGE_READY, ready)).await?;
        info!(pid = std::process::id(), "bridge ready");

        let requests = TaskTracker::new();
        let mut frames = FrameReader::new(reader);

        loop {
            let frame = match frames.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to read input");
                    break;
                }
            };

            match frame {
                Frame::Malformed { line, error } => {
                    warn!(line = %line, error = %error, "ignoring malformed input line");
                }
                Frame::Diagnostic(value) => debug!(line = %value, "ignoring log line on input"),
                Frame::Message(value) => self.accept(&requests, value).await,
            }
        }

        info!("input closed, shutting down");
        self.shutdown(&requests).await;
        Ok(())
    }

    async fn accept(self: &Arc<Self>, requests: &TaskTracker, value: Value) {
        let id = value.get("id").cloned().filter(|id| !id.is_null());
        let request = match serde_json::from_value::<Request>(value) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "ignoring message that is not a request");
                if let Some(id) = id {
                    let err = BridgeError::InvalidRequest(e.to_string());
                    self.respond(Response::failure(id, &err)).await;
                }
                return;
            }
        };

        if request.id.as_ref().map_or(true, Value::is_null) {
            debug!(method = %request.method, "client notification ignored");
            return;
        }

        let bridge = Arc::clone(self);
        requests.spawn(async move {
            let response = bridge.handle(request).await;
            bridge.respond(response).await;
        });
    }

    async fn respond(&self, response: Response) {
        if let Err(e) = self.writer.send(&response).await {
            error!(error = %e, "failed to write response");
        }
    }

    /// Cancel every query, then give request handlers and queries one shared grace period
    ///
    /// Returns once everything finished or the grace period ran out, whichever is first.
    async fn shutdown(&self, requests: &TaskTracker) {
        let signalled = self.sessions.shutdown();
        info!(signalled, "cancelling active queries");

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        requests.close();
        if tokio::time::timeout_at(deadline, requests.wait()).await.is_err() {
            warn!(pending = requests.len(), "requests still running after shutdown grace period");
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        self.executor.drain(remaining).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NativeConnector;
    use pretty_assertions::assert_eq;

    fn bridge() -> Bridge {
        Bridge::new(
            BridgeConfig::ephemeral(),
            DatabaseRegistry::in_memory(),
            Arc::new(NativeConnector),
            FrameWriter::new(tokio::io::sink()),
        )
    }

    async fn call(bridge: &Bridge, method: &str, params: Value) -> Response {
        bridge.handle(Request::new(1, method, params)).await
    }

    #[test]
    fn test_method_names_round_trip() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        assert_eq!("query.fetchTableData".parse::<Method>().unwrap(), Method::FetchTableData);

        let err = "query.explode".parse::<Method>().unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_METHOD");
        assert_eq!(err.message(), "Unknown method: query.explode");
    }

    #[tokio::test]
    async fn test_ping_echoes_params() {
        let response = call(&bridge(), "ping", json!({"a": 1})).await;
        assert_eq!(response.result, Some(json!({"msg": "pong", "echo": {"a": 1}})));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let response = call(&bridge(), "nope", Value::Null).await;
        assert_eq!(response.error.unwrap().code, "UNKNOWN_METHOD");
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let bridge = bridge();
        let created = call(&bridge, "query.createSession", json!({})).await;
        let session_id = created.result.unwrap()["sessionId"].as_str().unwrap().to_string();

        let health = call(&bridge, "health.ping", Value::Null).await.result.unwrap();
        assert_eq!(health["sessions"], 1);

        let cancel = call(&bridge, "query.cancel", json!({"sessionId": session_id})).await;
        assert_eq!(cancel.result, Some(json!({"ok": true, "cancelled": false})));

        let destroyed = call(&bridge, "query.destroySession", json!({"sessionId": session_id})).await;
        assert_eq!(destroyed.result, Some(json!({"ok": true})));

        let again = call(&bridge, "query.cancel", json!({"sessionId": session_id})).await;
        assert_eq!(again.error.unwrap().code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_run_validates_params() {
        let bridge = bridge();
        let err = call(&bridge, "query.run", json!({"sql": "SELECT 1"})).await.error.unwrap();
        assert_eq!(err.message, "Missing sessionId");

        let sid = bridge.sessions().create_session();
        let err = call(&bridge, "query.run", json!({"sessionId": sid})).await.error.unwrap();
        assert_eq!(err.message, "Missing sql");

        let err = call(&bridge, "query.run", json!({"sessionId": sid, "sql": "SELECT 1"}))
            .await
            .error
            .unwrap();
        assert_eq!(err.message, "Missing connection or databaseId");
        assert_eq!(bridge.sessions().active_query_count(), 0);
    }

    #[tokio::test]
    async fn test_database_methods() {
        let bridge = bridge();
        let added = call(
            &bridge,
            "db.add",
            json!({"name": "db", "type": "mysql", "host": "h", "port": 3306, "user": "u", "database": "d", "password": "p"}),
        )
        .await
        .result
        .unwrap();
        let id = added["id"].as_str().unwrap().to_string();
        assert!(added.get("credentialId").is_none());

        let listed = call(&bridge, "db.list", Value::Null).await.result.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let updated =
            call(&bridge, "db.update", json!({"id": id, "name": "renamed"})).await.result.unwrap();
        assert_eq!(updated["name"], "renamed");

        let missing = call(&bridge, "db.get", json!({})).await.error.unwrap();
        assert_eq!(missing.message, "Missing id");

        let deleted = call(&bridge, "db.delete", json!({"id": id})).await;
        assert_eq!(deleted.result, Some(json!({"ok": true})));
        let gone = call(&bridge, "db.get", json!({"id": id})).await.error.unwrap();
        assert_eq!(gone.message, "Database not found");
    }
}
