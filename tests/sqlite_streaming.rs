//! `SQLite` End-to-End Tests
//!
//! Runs real queries through the bridge against a temporary `SQLite` file:
//! saved-profile introspection, paged reads and streaming through the executor.

#![cfg(feature = "sqlite")]

mod common;

use common::Harness;
use pretty_assertions::assert_eq;
use querybridge::{
    Bridge, BridgeConfig, ConnectionConfig, DatabaseRegistry, FrameWriter, NativeConnector, QueryExecutor,
    QueryRequest, QueryState, Request, SessionRegistry,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

fn seed_database(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("shop.db");
    let conn = rusqlite::Connection::open(&path).expect("Failed to create database");
    conn.execute_batch(
        "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL);
         WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 250)
         INSERT INTO products (name, price) SELECT 'item ' || n, n * 1.5 FROM seq;
         CREATE VIEW cheap AS SELECT * FROM products WHERE price < 10;",
    )
    .expect("Failed to seed database");
    path
}

fn bridge() -> Bridge {
    Bridge::new(
        BridgeConfig::ephemeral(),
        DatabaseRegistry::in_memory(),
        Arc::new(NativeConnector),
        FrameWriter::new(tokio::io::sink()),
    )
}

async fn call(bridge: &Bridge, method: &str, params: Value) -> Value {
    let response = bridge.handle(Request::new(1, method, params)).await;
    assert!(!response.is_error(), "{method} failed: {:?}", response.error);
    response.result.unwrap()
}

#[tokio::test]
async fn test_saved_sqlite_profile_introspection() {
    let dir = TempDir::new().unwrap();
    let path = seed_database(&dir);
    let bridge = bridge();

    let profile = call(
        &bridge,
        "db.add",
        json!({"name": "shop", "type": "sqlite", "database": path.to_string_lossy()}),
    )
    .await;
    let id = profile["id"].as_str().unwrap();

    let status = call(&bridge, "db.connectTest", json!({"id": id})).await;
    assert_eq!(status["ok"], true);
    assert_eq!(status["status"], "connected");

    let schemas = call(&bridge, "db.listSchemas", json!({"dbId": id})).await;
    assert_eq!(schemas, json!([{"name": "main"}]));

    let tables = call(&bridge, "db.listTables", json!({"id": id})).await;
    let names: Vec<_> = tables.as_array().unwrap().iter().map(|t| t["name"].clone()).collect();
    assert_eq!(names, vec![json!("cheap"), json!("products")]);

    let columns = call(&bridge, "db.describeTable", json!({"id": id, "table": "products"})).await;
    let columns = columns.as_array().unwrap();
    assert_eq!(columns.len(), 3);
    assert_eq!(columns[0]["name"], "id");
    assert_eq!(columns[0]["primaryKey"], true);
    assert_eq!(columns[1]["nullable"], false);

    let page = call(
        &bridge,
        "query.fetchTableData",
        json!({"dbId": id, "tableName": "products", "limit": 100, "page": 3}),
    )
    .await;
    assert_eq!(page["total"], 250);
    assert_eq!(page["page"], 3);
    assert_eq!(page["rows"].as_array().unwrap().len(), 50);
    assert_eq!(page["rows"][0]["id"], 201);
}

#[tokio::test]
async fn test_inline_connection_test_reports_failure_without_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.db");
    let status = call(
        &bridge(),
        "connection.test",
        json!({"config": {"type": "sqlite", "file": missing.to_string_lossy()}}),
    )
    .await;
    assert_eq!(status["ok"], false);
    assert_eq!(status["status"], "disconnected");
}

#[tokio::test]
async fn test_executor_streams_sqlite_rows() {
    let dir = TempDir::new().unwrap();
    let path = seed_database(&dir);

    let (mut client, server) = tokio::io::duplex(1 << 20);
    let sessions = Arc::new(SessionRegistry::new());
    let executor = QueryExecutor::new(
        Arc::clone(&sessions),
        Arc::new(NativeConnector),
        FrameWriter::new(server),
        &BridgeConfig::ephemeral(),
    );

    let session_id = sessions.create_session();
    let task = executor
        .start(QueryRequest {
            session_id: session_id.clone(),
            connection: ConnectionConfig::sqlite(path),
            sql: "SELECT id, name FROM products ORDER BY id".into(),
            batch_size: 100,
            fetch_timeout: Duration::from_secs(30),
        })
        .await
        .unwrap();

    let outcome = task.wait().await;
    assert_eq!(outcome.state, QueryState::Completed);
    assert_eq!(outcome.total_rows, 250);
    assert_eq!(outcome.total_batches, 3);
    assert_eq!(sessions.lookup(&session_id).unwrap().active_query_id, None);

    drop(executor);
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    let frames: Vec<Value> = buf
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_slice(l).unwrap())
        .collect();

    let methods: Vec<_> = frames.iter().map(|f| f["method"].as_str().unwrap()).collect();
    assert_eq!(
        methods,
        vec!["query.started", "query.result", "query.result", "query.result", "query.done"]
    );
    assert_eq!(frames[1]["params"]["columns"], json!(["id", "name"]));
    assert_eq!(frames[3]["params"]["rows"][0]["id"], 201);

    let ids: Vec<i64> = frames
        .iter()
        .filter(|f| f["method"] == "query.result")
        .flat_map(|f| f["params"]["rows"].as_array().unwrap().clone())
        .map(|row| row["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, (1..=250).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_cancel_stops_an_endless_query() {
    let dir = TempDir::new().unwrap();
    let path = seed_database(&dir);
    let config = BridgeConfig { progress_interval: Duration::from_secs(3600), ..BridgeConfig::ephemeral() };
    let mut harness = Harness::native(config);

    let sid = harness.create_session().await;
    let run = harness
        .request(
            "query.run",
            json!({
                "sessionId": sid,
                "sql": "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq) SELECT n FROM seq",
                "connection": {"type": "sqlite", "file": path.to_string_lossy()},
                "batchSize": 500
            }),
        )
        .await;
    let qid = run["result"]["queryId"].as_str().unwrap().to_string();

    loop {
        let note = harness.notification().await;
        if note["method"] == "query.result" {
            assert_eq!(note["params"]["rows"][0]["n"], 1);
            break;
        }
    }

    let ack = harness.request("query.cancel", json!({"sessionId": sid})).await;
    assert_eq!(ack["result"], json!({"ok": true, "cancelled": true}));
    harness.discard_buffered_results();

    let after = harness.until_done(&qid).await;
    assert_eq!(after.len(), 1);
    let done = &after[0]["params"];
    assert_eq!(done["cancelled"], true);
    assert_eq!(done["ok"], false);
    assert_eq!(done["totalRows"].as_u64().unwrap() % 500, 0);

    let health = harness.request("health.ping", json!({})).await;
    assert_eq!(health["result"]["activeQueries"], 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_executor_reports_rows_affected() {
    let dir = TempDir::new().unwrap();
    let path = seed_database(&dir);

    let sessions = Arc::new(SessionRegistry::new());
    let executor = QueryExecutor::new(
        Arc::clone(&sessions),
        Arc::new(NativeConnector),
        FrameWriter::new(tokio::io::sink()),
        &BridgeConfig::ephemeral(),
    );

    let session_id = sessions.create_session();
    let task = executor
        .start(QueryRequest {
            session_id,
            connection: ConnectionConfig::sqlite(path),
            sql: "UPDATE products SET price = price * 2 WHERE id <= 10".into(),
            batch_size: 200,
            fetch_timeout: Duration::from_secs(30),
        })
        .await
        .unwrap();

    let outcome = task.wait().await;
    assert_eq!(outcome.state, QueryState::Completed);
    assert_eq!(outcome.total_batches, 0);
    assert_eq!(outcome.rows_affected, Some(10));
}
