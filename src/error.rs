//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout querybridge.
//! Every error maps to a stable code that travels in RPC error objects
//! (`{"message": ..., "code": ...}`) and in failed `query.done` notifications.
//!
//! # Error Categories
//! - `InvalidInput`: Missing or malformed parameters (validation errors)
//! - `NotFound`: Unknown session, query or database id
//! - `Busy`: A session already has an in-flight query
//! - `ConnectionFailed`: The connector could not reach the database
//! - `QueryFailed`: Query execution errors, including fetch timeouts
//! - `EngineError`: Engine-specific introspection errors
//! - `ConfigError`: Data directory or registry file errors
//! - `UnknownMethod` / `InvalidRequest`: Protocol errors
//! - `Internal`: Invariant violations and I/O failures on the transport

use thiserror::Error;

/// Main error type for querybridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Invalid input or missing required parameters
    #[error("{0}")]
    InvalidInput(String),

    /// Unknown session, query or database
    #[error("{0}")]
    NotFound(String),

    /// Session already runs a query
    #[error("{0}")]
    Busy(String),

    /// Database connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed
    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    /// Engine-specific database error
    #[error("Engine error ({engine}): {detail}")]
    EngineError { engine: String, detail: String },

    /// Configuration error (data directory, registry files)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Method name not present in the dispatch table
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Line parsed as JSON but is not a request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal failure (transport I/O, task panics)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling by the UI.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Busy(_) => "BUSY",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::QueryFailed(_) => "QUERY_FAILED",
            Self::EngineError { .. } => "ENGINE_ERROR",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::UnknownMethod(_) => "UNKNOWN_METHOD",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get human-readable error message (no credentials, safe for the UI)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a "Missing required field: <field>" validation error
    pub fn missing_field(field: &str) -> Self {
        Self::InvalidInput(format!("Missing required field: {field}"))
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a busy error
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy(message.into())
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a query failed error
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed(message.into())
    }

    /// Create an engine-specific error
    pub fn engine_error(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::EngineError { engine: engine.into(), detail: detail.into() }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}

/// Result type alias for querybridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BridgeError::invalid_input("test").error_code(), "INVALID_INPUT");
        assert_eq!(BridgeError::not_found("test").error_code(), "NOT_FOUND");
        assert_eq!(BridgeError::busy("test").error_code(), "BUSY");
        assert_eq!(BridgeError::connection_failed("test").error_code(), "CONNECTION_FAILED");
        assert_eq!(BridgeError::query_failed("test").error_code(), "QUERY_FAILED");
        assert_eq!(BridgeError::engine_error("mysql", "test").error_code(), "ENGINE_ERROR");
        assert_eq!(BridgeError::config_error("test").error_code(), "CONFIG_ERROR");
        assert_eq!(BridgeError::UnknownMethod("x".into()).error_code(), "UNKNOWN_METHOD");
        assert_eq!(BridgeError::InvalidRequest("x".into()).error_code(), "INVALID_REQUEST");
        assert_eq!(BridgeError::internal("test").error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_messages_are_passed_through_for_client_errors() {
        assert_eq!(BridgeError::missing_field("host").message(), "Missing required field: host");
        assert_eq!(BridgeError::not_found("Database not found").message(), "Database not found");
        assert_eq!(BridgeError::invalid_input("Missing id").message(), "Missing id");
        assert_eq!(
            BridgeError::UnknownMethod("db.frobnicate".into()).message(),
            "Unknown method: db.frobnicate"
        );
    }

    #[test]
    fn test_engine_error_message() {
        let err = BridgeError::engine_error("postgres", "connection timeout");
        assert!(err.message().contains("postgres"));
        assert!(err.message().contains("connection timeout"));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: BridgeError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, BridgeError::Internal(_)));
        assert!(err.message().contains("gone"));
    }
}
