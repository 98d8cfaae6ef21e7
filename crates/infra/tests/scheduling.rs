mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;

use common::*;
use ordinal_core::{AggregateId, CommandId, DomainError, DomainResult};
use ordinal_events::{Command, CommandContext, EventStream, InMemoryEventBus};
use ordinal_infra::{
    AppendStatus, Engine, EngineConfig, EventStore, EventStoreError, FailureKind, InMemoryEventStore,
};

/// Holds appends touching one chosen aggregate for `delay`.
struct SlowStore {
    inner: InMemoryEventStore,
    slow: Mutex<Option<AggregateId>>,
    delay: Duration,
}

impl SlowStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryEventStore::new(),
            slow: Mutex::new(None),
            delay,
        }
    }

    fn slow_down(&self, id: AggregateId) {
        *self.slow.lock() = Some(id);
    }

    async fn pause_for(&self, streams: &[EventStream]) {
        let slow = *self.slow.lock();
        if streams.iter().any(|stream| Some(stream.aggregate_id()) == slow) {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl EventStore for SlowStore {
    fn supports_batch_append(&self) -> bool {
        self.inner.supports_batch_append()
    }

    async fn append(&self, stream: &EventStream) -> Result<AppendStatus, EventStoreError> {
        self.pause_for(std::slice::from_ref(stream)).await;
        self.inner.append(stream).await
    }

    async fn batch_append(&self, streams: &[EventStream]) -> Result<Vec<AppendStatus>, EventStoreError> {
        self.pause_for(streams).await;
        self.inner.batch_append(streams).await
    }

    async fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, EventStoreError> {
        self.inner.query(aggregate_id, aggregate_type, min_version, max_version).await
    }

    async fn find(&self, aggregate_id: AggregateId, version: u64) -> Result<Option<EventStream>, EventStoreError> {
        self.inner.find(aggregate_id, version).await
    }

    async fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Result<Option<EventStream>, EventStoreError> {
        self.inner.find_by_command(aggregate_id, command_id).await
    }
}

fn notes_on(store: Arc<SlowStore>, config: EngineConfig) -> anyhow::Result<Engine<Note, NoteCommand>> {
    ordinal_observability::init_for_tests();
    let engine = Engine::builder()
        .with_config(config)
        .with_event_store(store)
        .with_publisher(Arc::new(InMemoryEventBus::new()))
        .register("note.create", create_note)
        .register("note.change_title", change_title)
        .build()?;
    Ok(engine)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_io_of_one_aggregate_does_not_hold_up_the_others() -> anyhow::Result<()> {
    let store = Arc::new(SlowStore::new(Duration::from_millis(800)));
    let engine = notes_on(store.clone(), test_config().with_worker_pool_size(1))?;
    let slow = AggregateId::new();
    let fast = AggregateId::new();
    engine.execute(create(slow, "slow")).await?;
    engine.execute(create(fast, "fast")).await?;

    store.slow_down(slow);
    let stuck = engine.send(rename(slow, "eventually"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let quick = engine.execute(rename(fast, "quick")).await?;
    let took = started.elapsed();

    assert!(quick.is_success());
    assert!(took < Duration::from_millis(400), "unrelated aggregate waited {took:?}");
    assert!(stuck.await?.is_success());
    assert_eq!(store.inner.version_of(slow), 2);
    Ok(())
}

#[tokio::test]
async fn commands_of_one_run_share_batch_appends() -> anyhow::Result<()> {
    let h = harness(test_config());
    let id = AggregateId::new();
    h.engine.execute(create(id, "draft")).await?;
    let before = h.store.batch_calls();

    let results = join_all((0..50).map(|i| h.engine.execute(rename(id, format!("title-{i}"))))).await;
    let mut versions = Vec::new();
    for result in results {
        let result = result?;
        assert!(result.is_success(), "{result:?}");
        versions.push(result.version);
    }

    versions.sort_unstable();
    assert_eq!(versions, (2..=51).collect::<Vec<_>>());
    let batches = h.store.batch_calls() - before;
    assert!(batches < 10, "50 streams took {batches} batch appends");
    let note = h.engine.load(id).await?.context("note exists")?;
    assert_eq!(note.state().title, "title-49");
    assert_eq!(note.state().edits, 50);
    Ok(())
}

#[tokio::test]
async fn foreign_write_under_a_pipelined_run_re_executes_the_rest() -> anyhow::Result<()> {
    let h = harness(test_config());
    let id = AggregateId::new();
    h.engine.execute(create(id, "draft")).await?;
    h.store
        .append(&foreign_stream(id, 2, &[NoteEvent::TitleChanged { title: "theirs".into() }]))
        .await?;

    // Staged on the cached v1: the first stream collides, the rest follow it.
    let results = join_all((0..10).map(|i| h.engine.execute(rename(id, format!("ours-{i}"))))).await;
    let mut versions = Vec::new();
    for result in results {
        let result = result?;
        assert!(result.is_success(), "{result:?}");
        versions.push(result.version);
    }

    versions.sort_unstable();
    assert_eq!(versions, (3..=12).collect::<Vec<_>>());
    let note = h.engine.load(id).await?.context("note exists")?;
    assert_eq!(note.version(), 12);
    assert_eq!(note.state().title, "ours-9");
    assert_eq!(note.state().edits, 11);
    Ok(())
}

#[tokio::test]
async fn racing_creations_of_one_aggregate_commit_once() -> anyhow::Result<()> {
    let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
    let id = AggregateId::new();
    store.slow_down(id);

    // Untargeted creations route by command id, so both run at once.
    let claim = move |ctx: &mut CommandContext<Note>, command: &Command<NoteCommand>| -> DomainResult<()> {
        let NoteCommand::Create { title } = command.payload() else {
            return Err(DomainError::validation("expected a create command"));
        };
        ctx.add(id)?.stage(NoteEvent::Created { title: title.clone() });
        Ok(())
    };
    ordinal_observability::init_for_tests();
    let engine: Engine<Note, NoteCommand> = Engine::builder()
        .with_config(test_config())
        .with_event_store(store.clone())
        .with_publisher(Arc::new(InMemoryEventBus::new()))
        .register("note.create", claim)
        .build()?;

    let first = engine.send(Command::new(NoteCommand::Create { title: "first".into() }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Its stream id is still pending in the committing mailbox.
    let second = engine
        .execute(Command::new(NoteCommand::Create { title: "second".into() }))
        .await?;
    let first = first.await?;

    assert!(first.is_success());
    assert_eq!(first.version, 1);
    assert_eq!(second.failure_kind(), Some(FailureKind::Conflict));
    assert_eq!(store.inner.version_of(id), 1);
    let note = engine.load(id).await?.context("note exists")?;
    assert_eq!(note.state().title, "first");
    Ok(())
}
