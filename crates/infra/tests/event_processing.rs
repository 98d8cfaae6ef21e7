mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use common::*;
use ordinal_core::AggregateId;
use ordinal_events::{EventHandler, EventHandlerRegistry, EventRecord, EventStream, HandlerError};
use ordinal_infra::reaper::Reapable;
use ordinal_infra::{
    EngineConfig, EventProcessor, InMemoryPublishedVersionStore, PublishedVersionStore, RetryService,
};

type Log = Arc<Mutex<Vec<(String, u64)>>>;

/// Appends `(name, version)` for every event it sees; can be told to fail.
struct Recorder {
    name: String,
    log: Log,
    transient_failures: AtomicU32,
    permanent_at: Option<u64>,
}

impl Recorder {
    fn new(name: &str, log: &Log) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            transient_failures: AtomicU32::new(0),
            permanent_at: None,
        }
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, stream: &EventStream, _event: &EventRecord) -> Result<(), HandlerError> {
        if Some(stream.version()) == self.permanent_at {
            return Err(HandlerError::Permanent(format!("cannot project v{}", stream.version())));
        }
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(HandlerError::Transient("read model busy".into()));
        }
        self.log.lock().push((self.name.clone(), stream.version()));
        Ok(())
    }
}

fn renamed(id: AggregateId, version: u64) -> EventStream {
    foreign_stream(id, version, &[NoteEvent::TitleChanged { title: format!("v{version}") }])
}

fn versions_seen(log: &Log, name: &str) -> Vec<u64> {
    log.lock()
        .iter()
        .filter(|(handler, _)| handler == name)
        .map(|(_, version)| *version)
        .collect()
}

struct Rig {
    processor: Arc<EventProcessor>,
    versions: Arc<InMemoryPublishedVersionStore>,
    _shutdown: watch::Sender<bool>,
}

fn rig(handlers: EventHandlerRegistry, config: EngineConfig) -> Rig {
    ordinal_observability::init_for_tests();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let retry = Arc::new(RetryService::new(&config));
    let _retry_loop = retry.spawn(shutdown_rx);
    let versions = Arc::new(InMemoryPublishedVersionStore::new());
    let processor = Arc::new(EventProcessor::new(
        "projector",
        handlers,
        versions.clone(),
        retry,
        &config,
    ));
    Rig {
        processor,
        versions,
        _shutdown: shutdown,
    }
}

fn recording(log: &Log) -> EventHandlerRegistry {
    let mut handlers = EventHandlerRegistry::new();
    handlers.register("note.title_changed", Arc::new(Recorder::new("recorder", log)));
    handlers
}

#[tokio::test]
async fn out_of_order_streams_are_handled_in_version_order() {
    let log = Log::default();
    let rig = rig(recording(&log), test_config());
    let id = AggregateId::new();

    let mut done = Vec::new();
    for version in [1, 3, 2] {
        done.push(rig.processor.process(renamed(id, version)).await.unwrap());
    }
    for rx in done {
        rx.await.unwrap();
    }

    assert_eq!(versions_seen(&log, "recorder"), vec![1, 2, 3]);
    assert!(eventually(|| rig.processor.latest_handled_version(id) == Some(3)).await);
    assert_eq!(rig.versions.get("projector", "note", id).await.unwrap(), 3);
}

#[tokio::test]
async fn redelivered_streams_are_dropped() {
    let log = Log::default();
    let rig = rig(recording(&log), test_config());
    let id = AggregateId::new();
    rig.processor.process(renamed(id, 1)).await.unwrap().await.unwrap();
    rig.processor.process(renamed(id, 2)).await.unwrap().await.unwrap();

    // Completes without reaching the handlers.
    rig.processor.process(renamed(id, 2)).await.unwrap().await.unwrap();
    rig.processor.process(renamed(id, 1)).await.unwrap().await.unwrap();

    assert_eq!(versions_seen(&log, "recorder"), vec![1, 2]);
}

#[tokio::test]
async fn delivery_resumes_after_the_stored_checkpoint() {
    let log = Log::default();
    let rig = rig(recording(&log), test_config());
    let id = AggregateId::new();
    rig.versions.update("projector", "note", id, 5).await.unwrap();

    rig.processor.process(renamed(id, 5)).await.unwrap().await.unwrap();
    rig.processor.process(renamed(id, 6)).await.unwrap().await.unwrap();

    assert_eq!(versions_seen(&log, "recorder"), vec![6]);
}

#[tokio::test]
async fn reaped_mailbox_is_recreated_from_the_checkpoint() {
    let log = Log::default();
    let rig = rig(recording(&log), test_config().with_mailbox_timeout(Duration::ZERO));
    let id = AggregateId::new();
    for version in 1..=3 {
        rig.processor.process(renamed(id, version)).await.unwrap().await.unwrap();
    }

    let mailboxes = rig.processor.mailboxes();
    assert!(eventually(|| mailboxes.reap() == 1).await);
    assert_eq!(rig.processor.latest_handled_version(id), None);

    rig.processor.process(renamed(id, 2)).await.unwrap().await.unwrap();
    rig.processor.process(renamed(id, 4)).await.unwrap().await.unwrap();

    assert_eq!(versions_seen(&log, "recorder"), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn handlers_run_in_registration_order() {
    let log = Log::default();
    let mut handlers = EventHandlerRegistry::new();
    handlers
        .register("note.title_changed", Arc::new(Recorder::new("first", &log)))
        .register("note.title_changed", Arc::new(Recorder::new("second", &log)));
    let rig = rig(handlers, test_config());
    let id = AggregateId::new();

    rig.processor.process(renamed(id, 1)).await.unwrap().await.unwrap();

    let names: Vec<String> = log.lock().iter().map(|(name, _)| name.clone()).collect();
    assert_eq!(names, vec!["first", "second"]);
}

#[tokio::test]
async fn transient_handler_failures_are_retried_in_place() {
    let log = Log::default();
    let flaky = Recorder {
        transient_failures: AtomicU32::new(4),
        ..Recorder::new("flaky", &log)
    };
    let mut handlers = EventHandlerRegistry::new();
    handlers.register("note.title_changed", Arc::new(flaky));
    let rig = rig(handlers, test_config());
    let id = AggregateId::new();

    let first = rig.processor.process(renamed(id, 1)).await.unwrap();
    let second = rig.processor.process(renamed(id, 2)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        first.await.unwrap();
        second.await.unwrap();
    })
    .await
    .unwrap();

    assert_eq!(versions_seen(&log, "flaky"), vec![1, 2]);
}

#[tokio::test]
async fn permanent_handler_failure_skips_the_event() {
    let log = Log::default();
    let broken = Recorder {
        permanent_at: Some(2),
        ..Recorder::new("broken", &log)
    };
    let mut handlers = EventHandlerRegistry::new();
    handlers.register("note.title_changed", Arc::new(broken));
    let rig = rig(handlers, test_config());
    let id = AggregateId::new();

    for version in 1..=3 {
        rig.processor.process(renamed(id, version)).await.unwrap().await.unwrap();
    }

    assert_eq!(versions_seen(&log, "broken"), vec![1, 3]);
    assert_eq!(rig.versions.get("projector", "note", id).await.unwrap(), 3);
}

#[tokio::test]
async fn committed_streams_reach_subscribers_in_order() {
    let h = harness(test_config());
    let log = Log::default();
    let processor = h.engine.event_processor(
        "projector",
        recording(&log),
        Arc::new(InMemoryPublishedVersionStore::new()),
    );
    h.engine.subscribe(&processor, h.bus.subscribe());

    let id = AggregateId::new();
    h.engine.execute(create(id, "draft")).await.unwrap();
    for title in ["b", "c", "d"] {
        assert!(h.engine.execute(rename(id, title)).await.unwrap().is_success());
    }

    assert!(eventually(|| processor.latest_handled_version(id) == Some(4)).await);
    // `note.created` has no handler; the stream still advances the checkpoint.
    assert_eq!(versions_seen(&log, "recorder"), vec![2, 3, 4]);
    h.engine.shutdown().await;
}
