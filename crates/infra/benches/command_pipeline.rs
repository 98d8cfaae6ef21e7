use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use ordinal_core::{Aggregate, AggregateId, AggregateRoot, CommandId, DomainResult};
use ordinal_events::{Command, CommandContext, CommandPayload, Event, EventStream, InMemoryEventBus};
use ordinal_infra::aggregate_storage::{encode_events, replay};
use ordinal_infra::mailbox::{MailboxQueue, OrderedQueue, Versioned};
use ordinal_infra::{
    AggregateStorage, Engine, EngineConfig, EventStore, InMemoryEventStore, InMemorySnapshotStore, RetryService,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Added {
    by: i64,
}

impl Event for Added {
    fn event_type(&self) -> &'static str {
        "counter.added"
    }
}

impl Aggregate for Counter {
    type Event = Added;

    const AGGREGATE_TYPE: &'static str = "counter";

    fn empty(_id: AggregateId) -> Self {
        Self::default()
    }

    fn apply(&mut self, event: &Added) {
        self.total += event.by;
    }
}

#[derive(Debug, Clone)]
struct Add(i64);

impl CommandPayload for Add {
    fn command_type(&self) -> &'static str {
        "counter.add"
    }
}

fn add(ctx: &mut CommandContext<Counter>, command: &Command<Add>) -> DomainResult<()> {
    let id = command.aggregate_id().unwrap_or_default();
    if !ctx.existed() {
        ctx.add(id)?;
    }
    ctx.get()?.stage(Added { by: command.payload().0 });
    Ok(())
}

fn engine(runtime: &Runtime, config: EngineConfig) -> Engine<Counter, Add> {
    runtime.block_on(async {
        Engine::builder()
            .with_config(config)
            .with_event_store(Arc::new(InMemoryEventStore::new()))
            .with_publisher(Arc::new(InMemoryEventBus::new()))
            .register("counter.add", add)
            .build()
            .unwrap()
    })
}

fn command(id: AggregateId) -> Command<Add> {
    Command::new(Add(1)).for_aggregate(id)
}

fn bench_command_latency(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let engine = engine(&runtime, EngineConfig::default());
    let id = AggregateId::new();

    let mut group = c.benchmark_group("command_latency");
    group.bench_function("cached_aggregate", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(engine.execute(command(id)).await.unwrap());
        });
    });
    group.bench_function("new_aggregate", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(engine.execute(command(AggregateId::new())).await.unwrap());
        });
    });
    group.finish();
}

fn bench_concurrent_throughput(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let engine = engine(&runtime, EngineConfig::default().with_worker_pool_size(16));

    let mut group = c.benchmark_group("concurrent_commands");
    for aggregates in [1usize, 16, 128] {
        let ids: Vec<AggregateId> = (0..aggregates).map(|_| AggregateId::new()).collect();
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::from_parameter(aggregates), &ids, |b, ids| {
            b.to_async(&runtime).iter(|| async {
                let sends = (0..256).map(|i| engine.execute(command(ids[i % ids.len()])));
                black_box(join_all(sends).await);
            });
        });
    }
    group.finish();
}

fn history(id: AggregateId, versions: u64) -> Vec<EventStream> {
    (1..=versions)
        .map(|version| {
            let records = encode_events::<Counter>(&[Added { by: 1 }]).unwrap();
            EventStream::new(id, Counter::AGGREGATE_TYPE, version, CommandId::new(), records)
        })
        .collect()
}

fn bench_reconstruction(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let retry = Arc::new(RetryService::new(&EngineConfig::default()));

    let mut group = c.benchmark_group("reconstruction");
    for versions in [10u64, 100, 1000] {
        let id = AggregateId::new();
        let store = Arc::new(InMemoryEventStore::new());
        let streams = history(id, versions);
        runtime.block_on(async {
            for stream in &streams {
                store.append(stream).await.unwrap();
            }
        });

        let replaying = AggregateStorage::<Counter>::new(store.clone(), Arc::new(InMemorySnapshotStore::new()), retry.clone());
        let snapshotting = AggregateStorage::<Counter>::new(store.clone(), Arc::new(InMemorySnapshotStore::new()), retry.clone());
        // Snapshot a few versions behind the head so a short tail is replayed.
        let mut root = AggregateRoot::<Counter>::new(id);
        replay(&mut root, &streams[..streams.len() - 5]).unwrap();
        runtime.block_on(snapshotting.save_snapshot(&root)).unwrap();

        group.throughput(Throughput::Elements(versions));
        group.bench_with_input(BenchmarkId::new("full_replay", versions), &id, |b, id| {
            b.to_async(&runtime)
                .iter(|| async { black_box(replaying.load(*id).await.unwrap()) });
        });
        group.bench_with_input(BenchmarkId::new("snapshot_and_tail", versions), &id, |b, id| {
            b.to_async(&runtime)
                .iter(|| async { black_box(snapshotting.load(*id).await.unwrap()) });
        });
    }
    group.finish();
}

struct Slot(u64);

impl Versioned for Slot {
    fn version(&self) -> u64 {
        self.0
    }
}

fn bench_ordered_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordered_admission");
    group.throughput(Throughput::Elements(1000));
    group.bench_function("reversed_arrivals", |b| {
        b.iter(|| {
            let mut queue = OrderedQueue::starting_at(0);
            for version in (1..=1000).rev() {
                black_box(queue.push(Slot(version)));
            }
            let (batch, receipt) = queue.take_batch(1000);
            queue.settle(receipt);
            black_box(batch.len())
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_command_latency,
    bench_concurrent_throughput,
    bench_reconstruction,
    bench_ordered_admission
);
criterion_main!(benches);
