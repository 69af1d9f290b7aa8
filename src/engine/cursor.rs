//! Pull-based row cursors
//!
//! A [`RowCursor`] owns one database connection and hands out bounded batches on
//! demand. Nothing is fetched ahead of the consumer: the next batch is read only when
//! `next_batch` is called again.
//!
//! Drivers whose connection cannot live inside an async struct (blocking `SQLite`, or a
//! `MySQL` result set borrowing its connection) run a producer task instead and expose it
//! through [`PullCursor`], a one-request-one-reply channel pair.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use super::RowBatch;
use crate::error::{BridgeError, Result};

/// How long `close` waits for a producer to wind down
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Streaming result cursor
#[async_trait]
pub trait RowCursor: Send {
    /// Pull the next batch, or `None` once the result is exhausted
    async fn next_batch(&mut self) -> Result<Option<RowBatch>>;

    /// Affected-row count for statements that return no rows
    fn rows_affected(&self) -> Option<u64> {
        None
    }

    /// Release the connection, aborting server-side work if rows remain
    async fn close(&mut self);
}

/// Reply to one fetch request
#[derive(Debug)]
pub enum Fetch {
    Batch(RowBatch),
    Exhausted { rows_affected: Option<u64> },
}

pub type FetchReply = oneshot::Sender<Result<Fetch>>;

/// Producer side of a [`PullCursor`]
pub struct FetchRequests {
    rx: mpsc::Receiver<FetchReply>,
}

impl FetchRequests {
    /// Wait for the next fetch request; `None` once the cursor is closed
    pub async fn next(&mut self) -> Option<FetchReply> {
        self.rx.recv().await
    }

    /// Blocking variant for `spawn_blocking` producers
    pub fn blocking_next(&mut self) -> Option<FetchReply> {
        self.rx.blocking_recv()
    }
}

type AbortHook = Box<dyn FnOnce() + Send>;

/// Cursor backed by a producer task
pub struct PullCursor {
    requests: Option<mpsc::Sender<FetchReply>>,
    worker: Option<JoinHandle<()>>,
    abort: Option<AbortHook>,
    exhausted: bool,
    rows_affected: Option<u64>,
}

impl PullCursor {
    /// Create the request channel shared by a cursor and its producer
    #[must_use]
    pub fn channel() -> (mpsc::Sender<FetchReply>, FetchRequests) {
        let (tx, rx) = mpsc::channel(1);
        (tx, FetchRequests { rx })
    }

    #[must_use]
    pub fn new(requests: mpsc::Sender<FetchReply>, worker: JoinHandle<()>) -> Self {
        Self {
            requests: Some(requests),
            worker: Some(worker),
            abort: None,
            exhausted: false,
            rows_affected: None,
        }
    }

    /// Hook run when the cursor is closed or dropped before exhaustion
    #[must_use]
    pub fn with_abort(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.abort = Some(Box::new(hook));
        self
    }

    fn run_abort(&mut self) {
        if !self.exhausted {
            if let Some(abort) = self.abort.take() {
                abort();
            }
        }
    }
}

#[async_trait]
impl RowCursor for PullCursor {
    async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.exhausted {
            return Ok(None);
        }
        let Some(requests) = &self.requests else {
            return Ok(None);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(reply_tx)
            .await
            .map_err(|_| BridgeError::query_failed("Cursor producer stopped unexpectedly"))?;

        match reply_rx.await {
            Ok(Ok(Fetch::Batch(batch))) => Ok(Some(batch)),
            Ok(Ok(Fetch::Exhausted { rows_affected })) => {
                self.exhausted = true;
                self.rows_affected = rows_affected;
                Ok(None)
            }
            Ok(Err(e)) => {
                self.exhausted = true;
                Err(e)
            }
            Err(_) => {
                self.exhausted = true;
                Err(BridgeError::query_failed("Cursor producer dropped the fetch"))
            }
        }
    }

    fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    async fn close(&mut self) {
        drop(self.requests.take());
        self.run_abort();

        if let Some(mut worker) = self.worker.take() {
            match tokio::time::timeout(WORKER_JOIN_TIMEOUT, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "cursor producer failed"),
                Err(_) => {
                    warn!("cursor producer did not stop in time, detaching");
                    worker.abort();
                }
            }
        }
    }
}

impl Drop for PullCursor {
    fn drop(&mut self) {
        self.run_abort();
    }
}

/// Cursor over rows that are already materialized
///
/// Used for statements the driver executes eagerly (DDL/DML) and in tests.
pub struct VecCursor {
    batches: std::collections::VecDeque<RowBatch>,
    rows_affected: Option<u64>,
}

impl VecCursor {
    /// Split `columns` + `rows` into batches of `batch_size`
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<super::JsonRow>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        let mut batches = std::collections::VecDeque::new();
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<_> = rows.by_ref().take(batch_size).collect();
            batches.push_back(RowBatch { columns: columns.clone(), rows: chunk });
        }
        Self { batches, rows_affected: None }
    }

    /// Cursor for a statement that produced no rows
    #[must_use]
    pub fn affected(rows_affected: u64) -> Self {
        Self { batches: std::collections::VecDeque::new(), rows_affected: Some(rows_affected) }
    }
}

#[async_trait]
impl RowCursor for VecCursor {
    async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        Ok(self.batches.pop_front())
    }

    fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    async fn close(&mut self) {
        self.batches.clear();
    }
}
