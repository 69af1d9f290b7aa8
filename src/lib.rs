//! querybridge - Streaming Database Query Bridge
//!
//! A long-lived backend process that gives a UI process database access over
//! line-delimited JSON-RPC on stdin/stdout: connection testing, schema introspection,
//! a saved-database registry and, above all, session-oriented streaming queries.
//!
//! # Core Principles
//! - stdout carries protocol frames only; every log line goes to stderr
//! - Results stream in bounded batches; at most one batch per query is in memory
//! - Cancellation is cooperative and never corrupts the output stream
//! - Connections are owned by exactly one query and always released
//!
//! # Module Organization
//! - [`transport`] - newline-delimited JSON framing
//! - [`protocol`] - request, response and notification shapes
//! - [`bridge`] - method table, dispatch and the serve loop
//! - [`session`] - session table and query handles
//! - [`executor`] - streaming query state machine
//! - [`engine`] - `PostgreSQL`, `MySQL` and `SQLite` connectors
//! - [`registry`] - saved database profiles and credentials
//! - [`config`] - process configuration and data files
//! - [`error`] - error types and codes

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use bridge::{Bridge, Method};
pub use config::BridgeConfig;
pub use engine::{
    ColumnInfo, ConnectionConfig, ConnectionInfo, ConnectionStatus, Connector, DatabaseType,
    JsonRow, NativeConnector, RowBatch, RowCursor, SchemaSummary, TablePage, TableSummary,
};
pub use error::{BridgeError, Result};
pub use executor::{QueryExecutor, QueryOutcome, QueryRequest, QueryState, QueryTask};
pub use protocol::{ErrorInfo, Notification, Request, Response};
pub use registry::{DatabasePayload, DatabaseProfile, DatabaseRegistry};
pub use session::{CancelOutcome, QueryHandle, SessionRegistry};
pub use transport::{Frame, FrameReader, FrameWriter};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_exports() {
        let _engine_type = DatabaseType::Postgres;
        let _config = BridgeConfig::ephemeral();
        let _registry = DatabaseRegistry::in_memory();
        let _sessions = SessionRegistry::new();
        assert_eq!(Method::RunQuery.as_str(), "query.run");
    }
}
