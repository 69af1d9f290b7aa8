//! Framing Performance Benchmarks
//!
//! Measures the cost of turning result batches into wire frames and parsing
//! incoming lines:
//! - `query.result` encoding at common batch sizes
//! - Request line decoding

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use querybridge::protocol::{notify, Notification, QueryResult};
use querybridge::transport::{decode_line, encode_frame};
use querybridge::JsonRow;
use serde_json::json;

fn batch(rows: usize) -> QueryResult {
    let rows = (0..rows)
        .map(|i| {
            let mut row = JsonRow::new();
            row.insert("id".to_string(), json!(i));
            row.insert("name".to_string(), json!(format!("customer {i}")));
            row.insert("balance".to_string(), json!("1234.56"));
            row.insert("active".to_string(), json!(i % 2 == 0));
            row
        })
        .collect();

    QueryResult {
        session_id: "3f1c0a52-8f0e-4a36-9a1f-0a4f7f3b6d10".to_string(),
        query_id: "9d2b7c4e-1b9a-4d7e-8c55-6b1e2f3a4c5d".to_string(),
        batch_index: 0,
        columns: vec!["id".into(), "name".into(), "balance".into(), "active".into()],
        rows,
    }
}

fn bench_encode_result(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_query_result");
    for size in [1, 200, 5000] {
        let message = Notification::new(notify::QUERY_RESULT, batch(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| encode_frame(black_box(message)).unwrap());
        });
    }
    group.finish();
}

fn bench_decode_request(c: &mut Criterion) {
    let line = br#"{"id":42,"method":"query.run","params":{"sessionId":"3f1c0a52","databaseId":"d1","sql":"SELECT * FROM orders","batchSize":500}}"#;

    c.bench_function("decode_request_line", |b| {
        b.iter(|| decode_line(black_box(line)));
    });
}

criterion_group!(benches, bench_encode_result, bench_decode_request);
criterion_main!(benches);
