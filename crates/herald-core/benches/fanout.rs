//! Fan-out benchmarks for herald-core.
//!
//! These measure local delivery: encode once, queue on every subscriber.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;
use tenvis_herald_bus::MemoryBus;
use tenvis_herald_core::adapter::{AdapterConfig, HorizontalAdapter};
use tenvis_herald_core::channel::{new_index, Channel, ChannelKey};
use tenvis_herald_core::{App, Broadcaster, Connection, Event, Outbound};

fn setup(subscribers: usize) -> (Broadcaster, Vec<Outbound>) {
    let app = Arc::new(App::new("1", "key", "secret"));
    let index = new_index();
    let key = ChannelKey::new("1", "game-1");
    let mut channel = Channel::new("game-1");
    let mut receivers = Vec::with_capacity(subscribers);
    for _ in 0..subscribers {
        let (connection, outbound) = Connection::new(Arc::clone(&app), 1024);
        channel.insert(connection);
        receivers.push(outbound);
    }
    index.insert(key, channel);

    let adapter = HorizontalAdapter::new(Arc::new(MemoryBus::new().transport()), AdapterConfig::default());
    (Broadcaster::new(index, adapter), receivers)
}

/// Benchmark delivery to growing channels.
fn bench_deliver_local(c: &mut Criterion) {
    let mut group = c.benchmark_group("deliver_local");
    let event = Event::new("1", "game-1", "score-update", json!({"score": 42}));

    for subscribers in [1usize, 100, 1000] {
        let (broadcaster, mut receivers) = setup(subscribers);
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    let delivered = broadcaster.deliver_local(black_box(&event));
                    for rx in &mut receivers {
                        let _ = rx.try_recv();
                    }
                    delivered
                })
            },
        );
    }

    group.finish();
}

/// Benchmark event creation and framing.
fn bench_event_frame(c: &mut Criterion) {
    c.bench_function("event_to_frame", |b| {
        b.iter(|| {
            Event::new(
                black_box("1"),
                black_box("game-1"),
                black_box("score-update"),
                json!({"score": 42}),
            )
            .to_frame()
        })
    });
}

criterion_group!(benches, bench_deliver_local, bench_event_frame);
criterion_main!(benches);
