//! Codec benchmarks for herald-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use herald_protocol::{cluster, codec, ClusterBody, ClusterMessage, Frame};
use serde_json::json;

fn bench_encode_event(c: &mut Criterion) {
    let frame = Frame::channel_event("score-update", "game-1", json!({"score": 42}));

    let mut group = c.benchmark_group("encode");
    group.bench_function("channel_event", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_subscribe(c: &mut Criterion) {
    let text = r#"{"event":"pusher:subscribe","data":{"channel":"private-orders","auth":"key:0123456789abcdef"}}"#;

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("subscribe", |b| {
        b.iter(|| codec::decode_client(black_box(text)))
    });
    group.finish();
}

fn bench_cluster_roundtrip(c: &mut Criterion) {
    let message = ClusterMessage::new(
        "node-a",
        "app-1",
        ClusterBody::Broadcast {
            channel: "game-1".into(),
            event: "score-update".into(),
            data: json!({"score": 42, "padding": "x".repeat(256)}),
            except: None,
            user_id: None,
        },
    );

    c.bench_function("cluster_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = cluster::encode(black_box(&message)).unwrap();
            cluster::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_event,
    bench_decode_subscribe,
    bench_cluster_roundtrip
);
criterion_main!(benches);
