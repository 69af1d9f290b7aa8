//! Shared test helpers: a scripted connector and an in-process bridge harness

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use querybridge::engine::{ColumnInfo, ConnectionStatus, SchemaSummary, TablePage, TableSummary};
use querybridge::{
    Bridge, BridgeConfig, BridgeError, ConnectionConfig, Connector, DatabaseRegistry, Frame,
    FrameReader, FrameWriter, JsonRow, NativeConnector, Result, RowBatch, RowCursor,
};

/// How a scripted query behaves
#[derive(Debug, Clone)]
pub struct Script {
    /// Total rows, `None` for an endless result
    pub rows: Option<u64>,
    /// Delay before each batch is produced
    pub delay: Duration,
    /// Fail when this batch index is requested
    pub fail_at_batch: Option<u64>,
    /// Fail while opening the cursor
    pub fail_open: bool,
    /// Never finish connecting (open and connection tests pend forever)
    pub hang: bool,
}

impl Script {
    pub fn rows(rows: u64) -> Self {
        Self { rows: Some(rows), delay: Duration::ZERO, fail_at_batch: None, fail_open: false, hang: false }
    }

    pub fn endless(delay: Duration) -> Self {
        Self { rows: None, delay, fail_at_batch: None, fail_open: false, hang: false }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_at(mut self, batch: u64) -> Self {
        self.fail_at_batch = Some(batch);
        self
    }

    pub fn failing_open() -> Self {
        Self { fail_open: true, ..Self::rows(0) }
    }

    /// A server that accepts the socket but never answers the handshake
    pub fn hanging() -> Self {
        Self { hang: true, ..Self::rows(0) }
    }
}

/// Connector producing integer rows `{"n": i}` according to a [`Script`]
pub struct ScriptedConnector {
    script: Mutex<Script>,
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub batch_sizes: Mutex<Vec<usize>>,
}

impl ScriptedConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn script(&self) -> Script {
        self.script.lock().unwrap().clone()
    }
}

struct ScriptedCursor {
    script: Script,
    batch_size: usize,
    next_row: u64,
    batch_index: u64,
    closed: Arc<AtomicUsize>,
    is_closed: bool,
}

#[async_trait]
impl RowCursor for ScriptedCursor {
    async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if !self.script.delay.is_zero() {
            tokio::time::sleep(self.script.delay).await;
        }
        if self.script.fail_at_batch == Some(self.batch_index) {
            return Err(BridgeError::query_failed("scripted failure"));
        }

        let end = match self.script.rows {
            Some(total) if self.next_row >= total => return Ok(None),
            Some(total) => (self.next_row + self.batch_size as u64).min(total),
            None => self.next_row + self.batch_size as u64,
        };

        let rows = (self.next_row..end)
            .map(|n| {
                let mut row = JsonRow::new();
                row.insert("n".to_string(), json!(n));
                row
            })
            .collect();
        self.next_row = end;
        self.batch_index += 1;
        Ok(Some(RowBatch { columns: vec!["n".to_string()], rows }))
    }

    async fn close(&mut self) {
        if !self.is_closed {
            self.is_closed = true;
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn test_connection(&self, _config: &ConnectionConfig) -> ConnectionStatus {
        if self.script().hang {
            std::future::pending::<()>().await;
        }
        ConnectionStatus::disconnected("scripted connector has no server")
    }

    async fn open_cursor(
        &self,
        _config: &ConnectionConfig,
        _sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let script = self.script();
        if script.hang {
            std::future::pending::<()>().await;
        }
        if script.fail_open {
            return Err(BridgeError::connection_failed("scripted connect failure"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(batch_size);
        Ok(Box::new(ScriptedCursor {
            script,
            batch_size,
            next_row: 0,
            batch_index: 0,
            closed: Arc::clone(&self.closed),
            is_closed: false,
        }))
    }

    async fn list_schemas(&self, _: &ConnectionConfig) -> Result<Vec<SchemaSummary>> {
        Ok(vec![SchemaSummary { name: "public".to_string() }])
    }

    async fn list_tables(&self, _: &ConnectionConfig, _: Option<&str>) -> Result<Vec<TableSummary>> {
        Ok(Vec::new())
    }

    async fn describe_table(
        &self,
        _: &ConnectionConfig,
        _: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        Err(BridgeError::not_found(format!("Table not found: {table}")))
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

const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A bridge served over in-memory pipes
pub struct Harness {
    input: Option<DuplexStream>,
    output: FrameReader<DuplexStream>,
    pending: VecDeque<Value>,
    serve: Option<JoinHandle<Result<()>>>,
    next_id: u64,
    pub connector: Arc<ScriptedConnector>,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        let config = BridgeConfig {
            progress_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(2),
            ..BridgeConfig::ephemeral()
        };
        Self::with_config(script, config)
    }

    pub fn with_config(script: Script, config: BridgeConfig) -> Self {
        let connector = Arc::new(ScriptedConnector::new(script));
        Self::serving(connector.clone(), connector, config)
    }

    /// A bridge over the real drivers; `connector` stays an idle scripted one
    pub fn native(config: BridgeConfig) -> Self {
        let idle = Arc::new(ScriptedConnector::new(Script::rows(0)));
        Self::serving(Arc::new(NativeConnector), idle, config)
    }

    fn serving(
        serve_with: Arc<dyn Connector>,
        connector: Arc<ScriptedConnector>,
        config: BridgeConfig,
    ) -> Self {
        let (client_in, server_in) = tokio::io::duplex(1 << 16);
        let (server_out, client_out) = tokio::io::duplex(1 << 20);

        let bridge = Arc::new(Bridge::new(
            config,
            DatabaseRegistry::in_memory(),
            serve_with,
            FrameWriter::new(server_out),
        ));
        let serve = tokio::spawn(bridge.serve(server_in));

        Self {
            input: Some(client_in),
            output: FrameReader::new(client_out),
            pending: VecDeque::new(),
            serve: Some(serve),
            next_id: 1,
            connector,
        }
    }

    /// Write a raw line to the bridge
    pub async fn send_line(&mut self, line: &str) {
        let input = self.input.as_mut().expect("input already closed");
        input.write_all(line.as_bytes()).await.unwrap();
        input.write_all(b"\n").await.unwrap();
        input.flush().await.unwrap();
    }

    /// Read the next frame, whatever it is
    pub async fn next_frame(&mut self) -> Value {
        let frame = tokio::time::timeout(READ_TIMEOUT, self.output.next_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("output closed");
        match frame {
            Frame::Message(value) => value,
            other => panic!("unexpected frame from bridge: {other:?}"),
        }
    }

    /// Send a request and return its response, buffering notifications seen meanwhile
    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.send_request(method, params).await;
        self.response_for(json!(id)).await
    }

    /// Wait for the response carrying `id`
    pub async fn response_for(&mut self, id: Value) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame.get("id") == Some(&id) {
                return frame;
            }
            self.pending.push_back(frame);
        }
    }

    /// Next notification, buffered or fresh
    pub async fn notification(&mut self) -> Value {
        if let Some(idx) = self.pending.iter().position(|f| f.get("method").is_some()) {
            return self.pending.remove(idx).unwrap();
        }
        loop {
            let frame = self.next_frame().await;
            if frame.get("method").is_some() {
                return frame;
            }
            self.pending.push_back(frame);
        }
    }

    /// Forget buffered `query.result` notifications (those written before the last response)
    pub fn discard_buffered_results(&mut self) {
        self.pending.retain(|f| f["method"] != "query.result");
    }

    /// Every notification for `query_id` up to and including its `query.done`
    pub async fn until_done(&mut self, query_id: &str) -> Vec<Value> {
        let mut seen = Vec::new();
        loop {
            let note = self.notification().await;
            if note["params"]["queryId"] != query_id {
                continue;
            }
            let done = note["method"] == "query.done";
            seen.push(note);
            if done {
                return seen;
            }
        }
    }

    pub async fn create_session(&mut self) -> String {
        let response = self.request("query.createSession", json!({})).await;
        response["result"]["sessionId"].as_str().unwrap().to_string()
    }

    /// Start a query on `session_id` and return its query id
    pub async fn run(&mut self, session_id: &str, extra: Value) -> String {
        let mut params = json!({
            "sessionId": session_id,
            "sql": "SELECT n FROM numbers",
            "connection": {"type": "postgres", "host": "localhost", "user": "u", "database": "d"},
        });
        if let (Some(target), Some(extra)) = (params.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }
        let response = self.request("query.run", params).await;
        assert!(response.get("error").is_none(), "query.run failed: {response}");
        response["result"]["queryId"].as_str().unwrap().to_string()
    }

    /// Send a request without waiting for its response; returns the request id
    pub async fn send_request(&mut self, method: &str, params: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let line = json!({"id": id, "method": method, "params": params}).to_string();
        self.send_line(&line).await;
        id
    }

    /// Close stdin and measure how long the bridge takes to return from `serve`
    pub async fn close_input(&mut self) -> Duration {
        drop(self.input.take());
        let serve = self.serve.take().expect("bridge already stopped");
        let started = std::time::Instant::now();
        tokio::time::timeout(READ_TIMEOUT, serve).await.expect("bridge did not exit").unwrap().unwrap();
        started.elapsed()
    }

    /// Close stdin and wait for the bridge to exit, returning the remaining frames
    pub async fn shutdown(mut self) -> Vec<Value> {
        drop(self.input.take());
        let serve = self.serve.take().unwrap();
        tokio::time::timeout(READ_TIMEOUT, serve).await.expect("bridge did not exit").unwrap().unwrap();

        let mut rest: Vec<Value> = self.pending.drain(..).collect();
        while let Ok(Ok(Some(Frame::Message(value)))) =
            tokio::time::timeout(READ_TIMEOUT, self.output.next_frame()).await
        {
            rest.push(value);
        }
        rest
    }
}

/// Batch indexes of the `query.result` notifications in `frames`
pub fn batch_indexes(frames: &[Value]) -> Vec<u64> {
    frames
        .iter()
        .filter(|f| f["method"] == "query.result")
        .map(|f| f["params"]["batchIndex"].as_u64().unwrap())
        .collect()
}
