//! Session Registry
//!
//! Process-wide table of query sessions. A session runs at most one query at a time;
//! the registry stores only the active query id and its cancellation token; the
//! [`QueryHandle`] itself is owned by the executor task that streams the query.
//!
//! Every mutation happens under one mutex, and no lock is held across an await point.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{BridgeError, Result};

struct ActiveQuery {
    query_id: String,
    cancel: CancellationToken,
}

struct Session {
    created_at: DateTime<Utc>,
    active: Option<ActiveQuery>,
}

/// Read-only view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_query_id: Option<String>,
}

/// Handle for one in-flight query
///
/// `batch_index` starts at 0 and only moves forward; `cancelled` flips at most once.
#[derive(Debug)]
pub struct QueryHandle {
    pub session_id: String,
    pub query_id: String,
    cancel: CancellationToken,
    batch_index: u64,
}

impl QueryHandle {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shared cancellation signal for this query
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Index the next emitted batch will carry
    #[must_use]
    pub const fn batch_index(&self) -> u64 {
        self.batch_index
    }

    /// Record that the batch at the current index reached the transport
    pub fn advance(&mut self) {
        self.batch_index += 1;
    }
}

/// Result of a cancel request; all variants are successful acknowledgments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The active query was signalled by this call
    Cancelled,
    /// The active query had already been signalled
    AlreadyCancelled,
    /// The session exists but runs nothing
    NoActiveQuery,
}

impl CancelOutcome {
    /// Whether the session's query is (now) cancelled
    #[must_use]
    pub const fn cancelled(self) -> bool {
        matches!(self, Self::Cancelled | Self::AlreadyCancelled)
    }
}

/// Session table
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

fn session_not_found(session_id: &str) -> BridgeError {
    BridgeError::not_found(format!("Session not found: {session_id}"))
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a session and return its id
    pub fn create_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.table().insert(id.clone(), Session { created_at: Utc::now(), active: None });
        debug!(session_id = %id, "session created");
        id
    }

    pub fn lookup(&self, session_id: &str) -> Result<SessionInfo> {
        let table = self.table();
        let session = table.get(session_id).ok_or_else(|| session_not_found(session_id))?;
        Ok(SessionInfo {
            session_id: session_id.to_string(),
            created_at: session.created_at,
            active_query_id: session.active.as_ref().map(|q| q.query_id.clone()),
        })
    }

    /// Register a new query on an idle session
    pub fn begin_query(&self, session_id: &str) -> Result<QueryHandle> {
        let mut table = self.table();
        let session = table.get_mut(session_id).ok_or_else(|| session_not_found(session_id))?;

        if let Some(active) = &session.active {
            return Err(BridgeError::busy(format!(
                "Session {session_id} already has an active query ({})",
                active.query_id
            )));
        }

        let query_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        session.active = Some(ActiveQuery { query_id: query_id.clone(), cancel: cancel.clone() });

        Ok(QueryHandle { session_id: session_id.to_string(), query_id, cancel, batch_index: 0 })
    }

    /// Signal the session's active query, if any
    pub fn cancel(&self, session_id: &str) -> Result<CancelOutcome> {
        let table = self.table();
        let session = table.get(session_id).ok_or_else(|| session_not_found(session_id))?;

        Ok(match &session.active {
            None => CancelOutcome::NoActiveQuery,
            Some(active) if active.cancel.is_cancelled() => CancelOutcome::AlreadyCancelled,
            Some(active) => {
                active.cancel.cancel();
                CancelOutcome::Cancelled
            }
        })
    }

    /// Clear the active query if it is still `query_id`
    ///
    /// Returns whether anything was cleared.
    pub fn end_query(&self, session_id: &str, query_id: &str) -> bool {
        let mut table = self.table();
        let Some(session) = table.get_mut(session_id) else {
            return false;
        };

        if session.active.as_ref().is_some_and(|q| q.query_id == query_id) {
            session.active = None;
            true
        } else {
            false
        }
    }

    /// Cancel any active query and forget the session
    pub fn destroy_session(&self, session_id: &str) -> Result<()> {
        let session = self.table().remove(session_id).ok_or_else(|| session_not_found(session_id))?;
        if let Some(active) = session.active {
            active.cancel.cancel();
        }
        debug!(session_id, "session destroyed");
        Ok(())
    }

    /// Cancel every active query and clear the table
    ///
    /// Returns the number of queries that were signalled.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Session> = self.table().drain().map(|(_, s)| s).collect();
        let mut signalled = 0;
        for active in drained.into_iter().filter_map(|s| s.active) {
            if !active.cancel.is_cancelled() {
                active.cancel.cancel();
                signalled += 1;
            }
        }
        signalled
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.table().len()
    }

    #[must_use]
    pub fn active_query_count(&self) -> usize {
        self.table().values().filter(|s| s.active.is_some()).count()
    }
}
