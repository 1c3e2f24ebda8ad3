//! Envelope encode/decode cost for the job bodies the producer writes and
//! the dispatcher classifies.

#![allow(missing_docs)]

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::{json, Value};

use tubeq::{Envelope, Payload};

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn small_envelope() -> Envelope {
    stamped(object(json!({ "user_id": 42 })))
}

fn medium_envelope() -> Envelope {
    let tags: Vec<String> = (0..20).map(|i| format!("tag-{i}")).collect();
    stamped(object(json!({
        "order_id": "ord-2024-000917",
        "customer": { "id": 991, "email": "buyer@example.com", "tier": "gold" },
        "lines": (0..10).map(|i| json!({ "sku": format!("SKU-{i:04}"), "qty": i + 1, "price": 9.99 })).collect::<Vec<_>>(),
        "tags": tags,
    })))
}

fn large_envelope() -> Envelope {
    let attachments: Vec<Value> = (0..50)
        .map(|i| {
            json!({
                "name": format!("attachment_{i}.pdf"),
                "size": 1024 * (i + 1),
                "checksum": format!("sha256:{:064x}", i),
            })
        })
        .collect();
    stamped(object(json!({
        "document_id": "doc-large",
        "content": "x".repeat(16 * 1024),
        "attachments": attachments,
    })))
}

fn stamped(payload: Payload) -> Envelope {
    let at = NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .expect("valid timestamp");
    Envelope::stamped("ORDERS", payload, at)
}

fn cases() -> [(&'static str, Envelope); 3] {
    [
        ("small", small_envelope()),
        ("medium", medium_envelope()),
        ("large", large_envelope()),
    ]
}

fn bench_envelope_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_encode");
    group.sample_size(100);

    for (name, envelope) in cases() {
        let size = envelope.encode().expect("encode").len();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| black_box(black_box(&envelope).encode().expect("encode")));
        });
    }

    group.finish();
}

fn bench_envelope_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_decode");
    group.sample_size(100);

    for (name, envelope) in cases() {
        let body = envelope.encode().expect("encode");
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| black_box(Envelope::decode(black_box(&body)).expect("decode")));
        });
    }

    group.finish();
}

/// Decode plus the classification reads the dispatcher performs.
fn bench_envelope_classify(c: &mut Criterion) {
    let body = medium_envelope().encode().expect("encode");
    let malformed = b"{\"tag\":\"ORDERS\",\"data\":".to_vec();

    let mut group = c.benchmark_group("envelope_classify");
    group.bench_function("routable", |b| {
        b.iter(|| {
            let envelope = Envelope::decode(black_box(&body)).expect("decode");
            black_box((envelope.tag.is_some(), envelope.payload().is_some()))
        });
    });
    group.bench_function("malformed", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&malformed)).is_err()));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_envelope_classify
);
criterion_main!(benches);
