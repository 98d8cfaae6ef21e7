//! Ordered event delivery (subscriber side).
//!
//! Published streams can arrive duplicated or out of order. The processor
//! keeps one ordered mailbox per aggregate whose expected version starts at
//! the subscriber's checkpoint:
//!
//! - the next version is released (with any parked successors)
//! - a later version is parked until the gap closes
//! - an already admitted version is dropped and completed
//!
//! Released streams are dispatched event by event to every handler registered
//! for the event type, in registration order. The checkpoint is written after
//! the handlers ran, and only then does the mailbox's handled version move.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use ordinal_core::AggregateId;
use ordinal_events::{EventHandlerRegistry, EventStream, Subscription};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::mailbox::{
    Admission, MailboxHandler, MailboxRegistry, MailboxSettings, OrderedQueue, Versioned, Worker, WorkerPool,
};
use crate::published_version::PublishedVersionStore;
use crate::reaper::Reapable;
use crate::retry::RetryService;

/// A published stream plus its completion signal.
#[derive(Debug)]
pub struct ProcessingEvent {
    stream: Arc<EventStream>,
    done: Option<oneshot::Sender<()>>,
}

impl ProcessingEvent {
    pub fn new(stream: EventStream) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                stream: Arc::new(stream),
                done: Some(tx),
            },
            rx,
        )
    }

    /// Nobody waits for this one.
    pub fn detached(stream: EventStream) -> Self {
        Self {
            stream: Arc::new(stream),
            done: None,
        }
    }

    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    fn complete(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

impl Versioned for ProcessingEvent {
    fn version(&self) -> u64 {
        self.stream.version()
    }
}

pub type DeliveryMailboxes = MailboxRegistry<OrderedQueue<ProcessingEvent>>;

struct EventDispatcher {
    subscriber: Arc<str>,
    handlers: Arc<EventHandlerRegistry>,
    versions: Arc<dyn PublishedVersionStore>,
    retry: Arc<RetryService>,
}

impl EventDispatcher {
    async fn dispatch(&self, stream: &Arc<EventStream>, worker: &mut Worker) {
        for record in stream.events() {
            for handler in self.handlers.handlers_for(&record.event_type) {
                let handler = handler.clone();
                let shared = stream.clone();
                let owned = Arc::new(record.clone());
                let name = format!("event_handler.{}", handler.name());
                let outcome = worker
                    .suspend(self.retry.execute_until_success(&name, move || {
                        let handler = handler.clone();
                        let stream = shared.clone();
                        let record = owned.clone();
                        async move { handler.handle(&stream, &record).await }
                    }))
                    .await;
                if let Err(err) = outcome {
                    error!(
                        subscriber = %self.subscriber,
                        handler = %name,
                        stream_id = %stream.stream_id(),
                        event_type = %record.event_type,
                        error = %err,
                        "event handler failed permanently, event skipped"
                    );
                }
            }
        }
    }

    async fn checkpoint(&self, stream: &EventStream, worker: &mut Worker) {
        let versions = self.versions.clone();
        let subscriber = self.subscriber.clone();
        let aggregate_type: Arc<str> = Arc::from(stream.aggregate_type());
        let aggregate_id = stream.aggregate_id();
        let version = stream.version();
        let saved = worker
            .suspend(self.retry.execute_until_success("published_version.update", move || {
                let versions = versions.clone();
                let subscriber = subscriber.clone();
                let aggregate_type = aggregate_type.clone();
                async move {
                    versions
                        .update(&subscriber, &aggregate_type, aggregate_id, version)
                        .await
                }
            }))
            .await;
        if let Err(err) = saved {
            error!(subscriber = %self.subscriber, stream_id = %stream.stream_id(), error = %err, "published version not saved");
        }
    }
}

#[async_trait]
impl MailboxHandler<ProcessingEvent> for EventDispatcher {
    async fn handle(&self, key: &str, batch: Vec<ProcessingEvent>, worker: &mut Worker) -> Result<(), EngineError> {
        for event in batch {
            debug!(subscriber = %self.subscriber, mailbox = key, version = event.stream.version(), "delivering stream");
            self.dispatch(&event.stream, worker).await;
            self.checkpoint(&event.stream, worker).await;
            event.complete();
        }
        Ok(())
    }
}

/// Delivers published streams of one subscriber in per-aggregate order.
pub struct EventProcessor {
    subscriber: Arc<str>,
    mailboxes: Arc<DeliveryMailboxes>,
    versions: Arc<dyn PublishedVersionStore>,
    retry: Arc<RetryService>,
}

impl EventProcessor {
    pub fn new(
        subscriber: &str,
        handlers: EventHandlerRegistry,
        versions: Arc<dyn PublishedVersionStore>,
        retry: Arc<RetryService>,
        config: &EngineConfig,
    ) -> Self {
        let subscriber: Arc<str> = Arc::from(subscriber);
        let dispatcher = EventDispatcher {
            subscriber: subscriber.clone(),
            handlers: Arc::new(handlers),
            versions: versions.clone(),
            retry: retry.clone(),
        };
        let mailboxes: DeliveryMailboxes = MailboxRegistry::new(
            "delivery",
            Arc::new(dispatcher),
            WorkerPool::new("delivery", config.worker_pool_size),
            MailboxSettings {
                batch_size: config.event_batch_size,
                run_error_pause: config.run_error_pause,
            },
            config.mailbox_timeout,
        );
        Self {
            subscriber,
            mailboxes: Arc::new(mailboxes),
            versions,
            retry,
        }
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// Admit one stream. Only fails when the checkpoint of a not yet seen
    /// aggregate cannot be read; the event is dropped in that case.
    pub async fn enqueue(&self, event: ProcessingEvent) -> Result<(), EngineError> {
        let key = event.stream.aggregate_id().to_string();
        let event = match self.mailboxes.try_enqueue(&key, event) {
            Ok(admission) => {
                self.admitted(admission);
                return Ok(());
            }
            Err(event) => event,
        };

        let handled = self.published_version(&event.stream).await?;
        let admission = self
            .mailboxes
            .enqueue(&key, event, || OrderedQueue::starting_at(handled));
        self.admitted(admission);
        Ok(())
    }

    /// Admit `stream`; the receiver fires once it was handled or dropped.
    pub async fn process(&self, stream: EventStream) -> Result<oneshot::Receiver<()>, EngineError> {
        let (event, done) = ProcessingEvent::new(stream);
        self.enqueue(event).await?;
        Ok(done)
    }

    /// Handled version for an aggregate with a live mailbox.
    pub fn latest_handled_version(&self, aggregate_id: AggregateId) -> Option<u64> {
        self.mailboxes
            .get(&aggregate_id.to_string())
            .map(|mailbox| mailbox.inspect(OrderedQueue::latest_handled_version))
    }

    pub fn mailboxes(&self) -> Arc<dyn Reapable> {
        self.mailboxes.clone()
    }

    /// Feed a bus subscription into the processor until `shutdown` flips or
    /// the bus goes away.
    pub fn spawn_subscription(
        self: &Arc<Self>,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let processor = self.clone();
        tokio::spawn(async move {
            info!(subscriber = %processor.subscriber, "subscription started");
            loop {
                tokio::select! {
                    received = subscription.recv() => {
                        let Some(stream) = received else { break };
                        if let Err(err) = processor.enqueue(ProcessingEvent::detached(stream)).await {
                            error!(subscriber = %processor.subscriber, error = %err, "stream dropped");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!(subscriber = %processor.subscriber, "subscription stopped");
        })
    }

    fn admitted(&self, admission: Admission<ProcessingEvent>) {
        match admission {
            Admission::Queued => {}
            Admission::Deferred => debug!(subscriber = %self.subscriber, "stream parked until its predecessor arrives"),
            Admission::Rejected(event) => {
                debug!(
                    subscriber = %self.subscriber,
                    stream_id = %event.stream.stream_id(),
                    "stream already delivered, dropped"
                );
                event.complete();
            }
        }
    }

    async fn published_version(&self, stream: &EventStream) -> Result<u64, EngineError> {
        let versions = &self.versions;
        let subscriber = &*self.subscriber;
        let aggregate_type = stream.aggregate_type();
        let aggregate_id = stream.aggregate_id();
        self.retry
            .execute_with_retry("published_version.get", move || {
                versions.get(subscriber, aggregate_type, aggregate_id)
            })
            .await
    }
}
