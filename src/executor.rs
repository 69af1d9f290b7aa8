//! Streaming Query Executor
//!
//! Drives one query from an open cursor to exactly one `query.done`:
//!
//! ```text
//! Pending ──open cursor──▶ Running ──┬──▶ Completed
//!                                    ├──▶ Failed
//!                                    └──▶ Cancelled
//! ```
//!
//! The executor pulls one batch, writes it, and only then pulls the next, so at most
//! one batch per query is ever held in memory. Cancellation is observed while the
//! cursor is opened and before every fetch; each write re-checks it under the
//! output lock.
//!
//! Every streaming task is supervised: if it panics, the supervisor still releases the
//! session and writes a best-effort terminal notification.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::engine::{ConnectionConfig, Connector, RowCursor};
use crate::error::{BridgeError, Result};
use crate::protocol::{
    notify, ErrorInfo, Notification, QueryDone, QueryProgress, QueryResult, QueryStarted,
};
use crate::session::{QueryHandle, SessionRegistry};
use crate::transport::FrameWriter;

/// Everything needed to run one query
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub session_id: String,
    pub connection: ConnectionConfig,
    pub sql: String,
    pub batch_size: usize,
    pub fetch_timeout: Duration,
}

/// Terminal state of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    Completed,
    Failed,
    Cancelled,
}

/// Final accounting for a finished query, mirrored in its `query.done`
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub state: QueryState,
    pub total_rows: u64,
    pub total_batches: u64,
    pub elapsed: Duration,
    pub rows_affected: Option<u64>,
    pub error: Option<ErrorInfo>,
}

impl QueryOutcome {
    fn panicked(elapsed: Duration) -> Self {
        Self {
            state: QueryState::Failed,
            total_rows: 0,
            total_batches: 0,
            elapsed,
            rows_affected: None,
            error: Some(ErrorInfo::from_error(&BridgeError::internal("Query task panicked"))),
        }
    }

    fn done_params(&self, session_id: &str, query_id: &str) -> QueryDone {
        QueryDone {
            session_id: session_id.to_string(),
            query_id: query_id.to_string(),
            ok: self.state == QueryState::Completed,
            cancelled: self.state == QueryState::Cancelled,
            error: self.error.clone(),
            total_rows: self.total_rows,
            total_batches: self.total_batches,
            elapsed_ms: duration_ms(self.elapsed),
            rows_affected: self.rows_affected,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Handle to a running query
pub struct QueryTask {
    pub session_id: String,
    pub query_id: String,
    cancel: CancellationToken,
    supervisor: JoinHandle<QueryOutcome>,
}

impl QueryTask {
    /// Signal cancellation; the query ends before its next fetch
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal state
    pub async fn wait(self) -> QueryOutcome {
        match self.supervisor.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(query_id = %self.query_id, error = %e, "query supervisor failed");
                QueryOutcome::panicked(Duration::ZERO)
            }
        }
    }
}

impl std::fmt::Debug for QueryTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTask")
            .field("session_id", &self.session_id)
            .field("query_id", &self.query_id)
            .finish_non_exhaustive()
    }
}

/// Starts and supervises streaming queries
#[derive(Clone)]
pub struct QueryExecutor {
    sessions: Arc<SessionRegistry>,
    connector: Arc<dyn Connector>,
    out: FrameWriter,
    progress_interval: Duration,
    tracker: TaskTracker,
}

impl QueryExecutor {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionRegistry>,
        connector: Arc<dyn Connector>,
        out: FrameWriter,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            sessions,
            connector,
            out,
            progress_interval: config.progress_interval,
            tracker: TaskTracker::new(),
        }
    }

    /// Begin a query on its session and start streaming it
    ///
    /// Errors before `query.started` (unknown or busy session, connect or prepare
    /// failure) are returned here and leave the session idle. Opening the cursor is
    /// bounded by the fetch timeout and abandoned as soon as the query is cancelled.
    pub async fn start(&self, request: QueryRequest) -> Result<QueryTask> {
        let handle = self.sessions.begin_query(&request.session_id)?;
        let started = Instant::now();

        info!(
            session_id = %handle.session_id,
            query_id = %handle.query_id,
            engine = %request.connection.engine,
            batch_size = request.batch_size,
            "query starting"
        );

        let token = handle.cancel_token().clone();
        let opening = tokio::time::timeout(
            request.fetch_timeout,
            self.connector.open_cursor(&request.connection, &request.sql, request.batch_size),
        );
        let opened = tokio::select! {
            () = token.cancelled() => Err(BridgeError::query_failed("Query cancelled before it started")),
            opened = opening => opened.unwrap_or_else(|_| {
                Err(BridgeError::connection_failed(format!(
                    "Opening the query timed out after {} ms",
                    duration_ms(request.fetch_timeout)
                )))
            }),
        };

        let cursor = match opened {
            Ok(cursor) => cursor,
            Err(e) => {
                self.sessions.end_query(&handle.session_id, &handle.query_id);
                warn!(query_id = %handle.query_id, error = %e, "query failed to open");
                return Err(e);
            }
        };

        let started_params =
            QueryStarted { session_id: handle.session_id.clone(), query_id: handle.query_id.clone() };
        if let Err(e) = self.out.send(&Notification::new(notify::QUERY_STARTED, started_params)).await {
            warn!(query_id = %handle.query_id, error = %e, "failed to write query.started");
        }

        let session_id = handle.session_id.clone();
        let query_id = handle.query_id.clone();
        let cancel = handle.cancel_token().clone();

        let run = StreamRun {
            handle,
            cursor,
            sessions: Arc::clone(&self.sessions),
            out: self.out.clone(),
            fetch_timeout: request.fetch_timeout,
            progress_interval: self.progress_interval,
            started,
        };
        let worker = tokio::spawn(run.run());

        let sessions = Arc::clone(&self.sessions);
        let out = self.out.clone();
        let (sid, qid) = (session_id.clone(), query_id.clone());
        let supervisor = self.tracker.spawn(async move {
            match worker.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(session_id = %sid, query_id = %qid, error = %e, "query task aborted");
                    sessions.end_query(&sid, &qid);
                    let outcome = QueryOutcome::panicked(started.elapsed());
                    let done = Notification::new(notify::QUERY_DONE, outcome.done_params(&sid, &qid));
                    if let Err(e) = out.send(&done).await {
                        warn!(query_id = %qid, error = %e, "failed to write query.done");
                    }
                    outcome
                }
            }
        });

        Ok(QueryTask { session_id, query_id, cancel, supervisor })
    }

    /// Wait up to `grace` for every supervised query to finish
    ///
    /// Callers cancel the queries first (see [`SessionRegistry::shutdown`]).
    /// Returns whether all of them finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let finished = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !finished {
            warn!(remaining = self.tracker.len(), "queries still running after shutdown grace period");
        }
        finished
    }

    /// Number of supervised queries that have not finished
    #[must_use]
    pub fn running(&self) -> usize {
        self.tracker.len()
    }
}

enum Termination {
    Completed,
    Failed(BridgeError),
    Cancelled,
}

struct StreamRun {
    handle: QueryHandle,
    cursor: Box<dyn RowCursor>,
    sessions: Arc<SessionRegistry>,
    out: FrameWriter,
    fetch_timeout: Duration,
    progress_interval: Duration,
    started: Instant,
}

impl StreamRun {
    async fn run(mut self) -> QueryOutcome {
        let mut total_rows = 0u64;
        let termination = self.pump(&mut total_rows).await;

        self.cursor.close().await;
        let rows_affected = self.cursor.rows_affected();
        self.sessions.end_query(&self.handle.session_id, &self.handle.query_id);

        let (state, error) = match termination {
            Termination::Completed => (QueryState::Completed, None),
            Termination::Cancelled => (QueryState::Cancelled, None),
            Termination::Failed(e) => (QueryState::Failed, Some(ErrorInfo::from_error(&e))),
        };
        let outcome = QueryOutcome {
            state,
            total_rows,
            total_batches: self.handle.batch_index(),
            elapsed: self.started.elapsed(),
            rows_affected: if state == QueryState::Completed { rows_affected } else { None },
            error,
        };

        let done = Notification::new(
            notify::QUERY_DONE,
            outcome.done_params(&self.handle.session_id, &self.handle.query_id),
        );
        if let Err(e) = self.out.send(&done).await {
            warn!(query_id = %self.handle.query_id, error = %e, "failed to write query.done");
        }

        info!(
            session_id = %self.handle.session_id,
            query_id = %self.handle.query_id,
            state = ?outcome.state,
            total_rows = outcome.total_rows,
            total_batches = outcome.total_batches,
            elapsed_ms = duration_ms(outcome.elapsed),
            "query finished"
        );
        outcome
    }

    async fn pump(&mut self, total_rows: &mut u64) -> Termination {
        let mut last_progress = self.started;

        loop {
            if self.handle.is_cancelled() {
                return Termination::Cancelled;
            }

            let batch = match tokio::time::timeout(self.fetch_timeout, self.cursor.next_batch()).await {
                Ok(Ok(Some(batch))) => batch,
                Ok(Ok(None)) => return Termination::Completed,
                Ok(Err(e)) => return Termination::Failed(e),
                Err(_) => {
                    return Termination::Failed(BridgeError::query_failed(format!(
                        "Fetch timed out after {} ms",
                        duration_ms(self.fetch_timeout)
                    )))
                }
            };

            let rows = batch.len() as u64;
            let result = Notification::new(
                notify::QUERY_RESULT,
                QueryResult {
                    session_id: self.handle.session_id.clone(),
                    query_id: self.handle.query_id.clone(),
                    batch_index: self.handle.batch_index(),
                    columns: batch.columns,
                    rows: batch.rows,
                },
            );

            match self.out.send_unless_cancelled(self.handle.cancel_token(), &result).await {
                Ok(true) => {}
                Ok(false) => return Termination::Cancelled,
                Err(e) => return Termination::Failed(e),
            }

            debug!(
                query_id = %self.handle.query_id,
                batch_index = self.handle.batch_index(),
                rows,
                "batch written"
            );
            self.handle.advance();
            *total_rows += rows;

            if last_progress.elapsed() >= self.progress_interval {
                last_progress = Instant::now();
                let progress = Notification::new(
                    notify::QUERY_PROGRESS,
                    QueryProgress {
                        session_id: self.handle.session_id.clone(),
                        query_id: self.handle.query_id.clone(),
                        rows_so_far: *total_rows,
                        batches: self.handle.batch_index(),
                        elapsed_ms: duration_ms(self.started.elapsed()),
                    },
                );
                if let Err(e) = self.out.send_unless_cancelled(self.handle.cancel_token(), &progress).await {
                    return Termination::Failed(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        ColumnInfo, ConnectionStatus, JsonRow, SchemaSummary, TablePage, TableSummary, VecCursor,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::io::AsyncReadExt;

    struct FixedConnector {
        rows: i64,
        fail_open: bool,
        /// Cancel this session's query while the cursor is being opened
        cancel_during_open: Option<(Arc<SessionRegistry>, String)>,
        /// Never finish opening
        hang_open: bool,
    }

    impl FixedConnector {
        fn rows(rows: i64) -> Self {
            Self { rows, fail_open: false, cancel_during_open: None, hang_open: false }
        }
    }

    #[async_trait]
    impl Connector for FixedConnector {
        async fn test_connection(&self, _config: &ConnectionConfig) -> ConnectionStatus {
            ConnectionStatus::disconnected("not used")
        }

        async fn open_cursor(
            &self,
            _config: &ConnectionConfig,
            _sql: &str,
            batch_size: usize,
        ) -> Result<Box<dyn RowCursor>> {
            if self.hang_open {
                std::future::pending::<()>().await;
            }
            if let Some((sessions, session_id)) = &self.cancel_during_open {
                sessions.cancel(session_id)?;
            }
            if self.fail_open {
                return Err(BridgeError::connection_failed("connection refused"));
            }
            let rows = (0..self.rows)
                .map(|n| {
                    let mut row = JsonRow::new();
                    row.insert("n".into(), json!(n));
                    row
                })
                .collect();
            Ok(Box::new(VecCursor::new(vec!["n".into()], rows, batch_size)))
        }

        async fn list_schemas(&self, _: &ConnectionConfig) -> Result<Vec<SchemaSummary>> {
            Ok(Vec::new())
        }

        async fn list_tables(&self, _: &ConnectionConfig, _: Option<&str>) -> Result<Vec<TableSummary>> {
            Ok(Vec::new())
        }

        async fn describe_table(
            &self,
            _: &ConnectionConfig,
            _: Option<&str>,
            _: &str,
        ) -> Result<Vec<ColumnInfo>> {
            Ok(Vec::new())
        }

        async fn fetch_table_data(
            &self,
            _: &ConnectionConfig,
            _: Option<&str>,
            _: &str,
            limit: u32,
            page: u32,
        ) -> Result<TablePage> {
            Ok(TablePage { rows: Vec::new(), total: 0, page, limit })
        }
    }

    fn executor(connector: FixedConnector) -> (QueryExecutor, Arc<SessionRegistry>, tokio::io::DuplexStream) {
        executor_with(Arc::new(SessionRegistry::new()), connector)
    }

    fn executor_with(
        sessions: Arc<SessionRegistry>,
        connector: FixedConnector,
    ) -> (QueryExecutor, Arc<SessionRegistry>, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let exec = QueryExecutor::new(
            Arc::clone(&sessions),
            Arc::new(connector),
            FrameWriter::new(server),
            &BridgeConfig::ephemeral(),
        );
        (exec, sessions, client)
    }

    fn request(session_id: &str, batch_size: usize) -> QueryRequest {
        QueryRequest {
            session_id: session_id.to_string(),
            connection: ConnectionConfig::default(),
            sql: "SELECT n".into(),
            batch_size,
            fetch_timeout: Duration::from_secs(5),
        }
    }

    async fn frames(mut client: tokio::io::DuplexStream, exec: QueryExecutor) -> Vec<Value> {
        drop(exec);
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_millis(200), client.read_to_end(&mut buf)).await;
        buf.split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_slice(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_completed_query_emits_ordered_batches_then_done() {
        let (exec, sessions, client) = executor(FixedConnector::rows(450));
        let sid = sessions.create_session();

        let task = exec.start(request(&sid, 200)).await.unwrap();
        let outcome = task.wait().await;
        assert_eq!(outcome.state, QueryState::Completed);
        assert_eq!(outcome.total_rows, 450);
        assert_eq!(outcome.total_batches, 3);
        assert_eq!(sessions.active_query_count(), 0);

        let frames = frames(client, exec).await;
        let methods: Vec<_> = frames.iter().filter_map(|f| f["method"].as_str()).collect();
        assert_eq!(methods.first(), Some(&"query.started"));
        assert_eq!(methods.last(), Some(&"query.done"));

        let indexes: Vec<_> = frames
            .iter()
            .filter(|f| f["method"] == "query.result")
            .map(|f| f["params"]["batchIndex"].as_u64().unwrap())
            .collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_open_failure_releases_session() {
        let (exec, sessions, _client) = executor(FixedConnector { fail_open: true, ..FixedConnector::rows(0) });
        let sid = sessions.create_session();

        let err = exec.start(request(&sid, 10)).await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
        assert_eq!(sessions.active_query_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_session_is_rejected() {
        let (exec, sessions, _client) = executor(FixedConnector::rows(10));
        let sid = sessions.create_session();
        let _held = sessions.begin_query(&sid).unwrap();

        let err = exec.start(request(&sid, 10)).await.unwrap_err();
        assert_eq!(err.error_code(), "BUSY");
    }

    #[tokio::test]
    async fn test_cancel_before_first_fetch() {
        let sessions = Arc::new(SessionRegistry::new());
        let sid = sessions.create_session();
        let connector = FixedConnector {
            cancel_during_open: Some((Arc::clone(&sessions), sid.clone())),
            ..FixedConnector::rows(1000)
        };
        let (exec, sessions, client) = executor_with(sessions, connector);

        let task = exec.start(request(&sid, 10)).await.unwrap();
        let outcome = task.wait().await;
        assert_eq!(outcome.state, QueryState::Cancelled);
        assert_eq!(outcome.total_rows, 0);
        assert_eq!(sessions.active_query_count(), 0);

        let frames = frames(client, exec).await;
        let methods: Vec<_> = frames.iter().filter_map(|f| f["method"].as_str()).collect();
        assert_eq!(methods, vec!["query.started", "query.done"]);
        assert_eq!(frames[1]["params"]["cancelled"], true);
        assert_eq!(frames[1]["params"]["totalBatches"], 0);
    }

    #[tokio::test]
    async fn test_cancel_while_opening_releases_session() {
        let (exec, sessions, client) = executor(FixedConnector { hang_open: true, ..FixedConnector::rows(10) });
        let sid = sessions.create_session();

        let start = {
            let exec = exec.clone();
            let req = request(&sid, 10);
            tokio::spawn(async move { exec.start(req).await })
        };
        while sessions.active_query_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sessions.cancel(&sid).unwrap().cancelled());

        let err = start.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "QUERY_FAILED");
        assert_eq!(sessions.active_query_count(), 0);
        assert!(frames(client, exec).await.is_empty());
    }

    #[tokio::test]
    async fn test_open_is_bounded_by_fetch_timeout() {
        let (exec, sessions, _client) = executor(FixedConnector { hang_open: true, ..FixedConnector::rows(10) });
        let sid = sessions.create_session();

        let mut req = request(&sid, 10);
        req.fetch_timeout = Duration::from_millis(50);
        let err = exec.start(req).await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
        assert_eq!(err.message(), "Connection failed: Opening the query timed out after 50 ms");
        assert_eq!(sessions.active_query_count(), 0);
    }

    #[test]
    fn test_done_params_for_each_state() {
        let mut outcome = QueryOutcome {
            state: QueryState::Cancelled,
            total_rows: 5,
            total_batches: 1,
            elapsed: Duration::from_millis(12),
            rows_affected: None,
            error: None,
        };
        let done = outcome.done_params("s", "q");
        assert!(!done.ok);
        assert!(done.cancelled);

        outcome.state = QueryState::Completed;
        let done = outcome.done_params("s", "q");
        assert!(done.ok);
        assert!(!done.cancelled);
        assert_eq!(done.elapsed_ms, 12);

        let failed = QueryOutcome::panicked(Duration::ZERO).done_params("s", "q");
        assert_eq!(failed.error.unwrap().code, "INTERNAL_ERROR");
    }
}
