use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use amflux::{
    Aggregator, AggregatorConfig, HandlerTable, LoopbackNetwork, ManualTicks, MessagePool,
};

fn bench_aggregate(c: &mut Criterion) {
    let config = AggregatorConfig::builder()
        .buffer_capacity(1 << 14)
        .autoflush_ticks(u64::MAX / 2)
        .build()
        .unwrap();
    let net = LoopbackNetwork::new(2);
    let mut table = HandlerTable::new();
    let id = table.register(|_, _| {});
    let handlers = Arc::new(table);
    let ticks = Arc::new(ManualTicks::new(0));
    let sender = Aggregator::new(net.endpoint(0), config.clone(), handlers.clone(), ticks.clone());
    let receiver = Aggregator::new(net.endpoint(1), config, handlers, ticks);

    let args = [0u8; 24];
    let mut group = c.benchmark_group("aggregate");
    group.throughput(Throughput::Elements(1));
    group.bench_function("stage_one_record", |b| {
        b.iter(|| {
            sender.aggregate(1, id, &args, b"");
        });
    });
    group.finish();
    // Drain whatever the capacity flushes put on the wire.
    sender.flush(1);
    while receiver.poll() {}

    let mut group = c.benchmark_group("roundtrip");
    group.throughput(Throughput::Elements(64));
    group.bench_function("batch_of_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                sender.aggregate(1, id, &args, b"");
            }
            sender.flush(1);
            while receiver.poll() {}
        });
    });
    group.finish();
}

fn bench_message_pool(c: &mut Criterion) {
    let pool = MessagePool::new();
    let mut group = c.benchmark_group("pool");
    group.throughput(Throughput::Elements(1));
    group.bench_function("issue_and_send", |b| {
        b.iter_batched(
            || pool.message(0, 1, amflux::HandlerId(0), b"argblock"),
            |mut m| {
                m.mark_enqueued();
                m.mark_delivered();
                m.mark_sent();
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_aggregate, bench_message_pool);
criterion_main!(benches);
