//! Event committing pipeline (one mailbox per aggregate).
//!
//! Streams produced by the command pipeline are persisted here in batches:
//!
//! ```text
//! EventCommittingContext (stream + staged aggregate + reply)
//!   ↓  dedup by stream id ("{aggregate_id}_{version}")
//! batch of up to `commit_batch_size`
//!   ↓  one batch_append, or one append per stream
//! per-stream status
//!   ├─ Success          → cache refresh → publish (until success) → snapshot? → Committed
//!   ├─ DuplicateCommand → Committed at the stored version
//!   ├─ VersionConflict  → same command already stored? Committed : Conflict
//!   └─ Rejected         → Failed(Validation)
//! ```
//!
//! Streams of one batch are judged independently: a conflicting stream does
//! not hold back the others. The exception is a [`StreamChain`]: streams
//! staged one on top of the other for the same aggregate. Once a link is not
//! appended, every later link reports a conflict without reaching the store.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use ordinal_core::{AggregateId, AggregateRoot};
use ordinal_events::{EventPublisher, EventStream};

use crate::aggregate_storage::{AggregateStorage, StoredAggregate};
use crate::cache::MemoryCache;
use crate::error::EngineError;
use crate::event_store::{AppendStatus, EventStore};
use crate::mailbox::{DedupQueue, Deduplicated, MailboxHandler, MailboxRegistry, Worker};
use crate::retry::RetryService;

/// How a commit attempt ended, as seen by the command pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { version: u64 },
    /// Another stream owns this version; re-execute on a fresh aggregate.
    Conflict { detail: String },
    Failed(EngineError),
}

/// Streams staged one on top of the other by a single command run.
///
/// Link `n + 1` was computed on the state link `n` produces, so it is only
/// valid while every earlier link made it into the store.
#[derive(Debug, Clone, Default)]
pub struct StreamChain(Arc<AtomicBool>);

impl StreamChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_broken(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn break_off(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// One stream on its way to the store.
#[derive(Debug)]
pub struct EventCommittingContext<A: StoredAggregate> {
    stream: EventStream,
    aggregate: AggregateRoot<A>,
    chain: StreamChain,
    reply: oneshot::Sender<CommitOutcome>,
}

impl<A: StoredAggregate> EventCommittingContext<A> {
    /// `aggregate` still holds the staged events `stream` was built from.
    pub fn new(stream: EventStream, aggregate: AggregateRoot<A>, reply: oneshot::Sender<CommitOutcome>) -> Self {
        Self {
            stream,
            aggregate,
            chain: StreamChain::new(),
            reply,
        }
    }

    /// Make this stream a link of `chain`.
    pub fn in_chain(mut self, chain: &StreamChain) -> Self {
        self.chain = chain.clone();
        self
    }

    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    pub fn complete(self, outcome: CommitOutcome) {
        if !matches!(outcome, CommitOutcome::Committed { .. }) {
            self.chain.break_off();
        }
        let _ = self.reply.send(outcome);
    }
}

impl<A: StoredAggregate> Deduplicated for EventCommittingContext<A> {
    fn dedup_key(&self) -> String {
        self.stream.stream_id()
    }
}

pub type CommittingMailboxes<A> = MailboxRegistry<DedupQueue<EventCommittingContext<A>>>;

pub struct EventCommitter<A: StoredAggregate> {
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn EventPublisher>,
    cache: Arc<MemoryCache<A>>,
    storage: Arc<AggregateStorage<A>>,
    retry: Arc<RetryService>,
    snapshot_interval: u64,
}

impl<A: StoredAggregate> EventCommitter<A> {
    pub fn new(
        store: Arc<dyn EventStore>,
        publisher: Arc<dyn EventPublisher>,
        cache: Arc<MemoryCache<A>>,
        storage: Arc<AggregateStorage<A>>,
        retry: Arc<RetryService>,
        snapshot_interval: u64,
    ) -> Self {
        Self {
            store,
            publisher,
            cache,
            storage,
            retry,
            snapshot_interval,
        }
    }

    async fn persist(&self, streams: Vec<EventStream>, worker: &mut Worker) -> Result<Vec<AppendStatus>, EngineError> {
        if self.store.supports_batch_append() {
            let store = self.store.clone();
            let streams = Arc::new(streams);
            return worker
                .suspend(self.retry.execute_until_success("event_store.batch_append", move || {
                    let store = store.clone();
                    let streams = streams.clone();
                    async move { store.batch_append(&streams).await }
                }))
                .await;
        }

        // Same rule a batch append follows: nothing after a failed link.
        let mut halted: HashSet<AggregateId> = HashSet::new();
        let mut statuses = Vec::with_capacity(streams.len());
        for stream in streams {
            if halted.contains(&stream.aggregate_id()) {
                statuses.push(AppendStatus::VersionConflict);
                continue;
            }
            let store = self.store.clone();
            let stream = Arc::new(stream);
            let appending = stream.clone();
            let status = worker
                .suspend(self.retry.execute_until_success("event_store.append", move || {
                    let store = store.clone();
                    let stream = appending.clone();
                    async move { store.append(&stream).await }
                }))
                .await?;
            if status != AppendStatus::Success {
                halted.insert(stream.aggregate_id());
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn settle(&self, ctx: EventCommittingContext<A>, status: AppendStatus, worker: &mut Worker) {
        match status {
            AppendStatus::Success => self.committed(ctx, worker).await,
            AppendStatus::DuplicateCommand { version } => {
                debug!(
                    stream_id = %ctx.stream.stream_id(),
                    command_id = %ctx.stream.command_id(),
                    version,
                    "command already committed"
                );
                self.cache.evict(ctx.stream.aggregate_id());
                // Later links were staged on top of a stream that was not appended.
                ctx.chain.break_off();
                ctx.complete(CommitOutcome::Committed { version });
            }
            AppendStatus::VersionConflict => self.conflicted(ctx, worker).await,
            AppendStatus::Rejected { reason } => {
                warn!(stream_id = %ctx.stream.stream_id(), reason = %reason, "stream rejected by event store");
                ctx.complete(CommitOutcome::Failed(EngineError::Validation(reason)));
            }
        }
    }

    async fn conflicted(&self, ctx: EventCommittingContext<A>, worker: &mut Worker) {
        let aggregate_id = ctx.stream.aggregate_id();
        let version = ctx.stream.version();
        let store = &self.store;
        let existing = worker
            .suspend(
                self.retry
                    .execute_with_retry("event_store.find", move || store.find(aggregate_id, version)),
            )
            .await;

        self.cache.evict(aggregate_id);
        match existing {
            Ok(Some(stored)) if stored.command_id() == ctx.stream.command_id() => {
                debug!(stream_id = %ctx.stream.stream_id(), "conflicting stream is our own, treating as committed");
                ctx.complete(CommitOutcome::Committed { version });
            }
            other => {
                if let Err(err) = other {
                    warn!(stream_id = %ctx.stream.stream_id(), error = %err, "could not inspect conflicting stream");
                }
                info!(
                    aggregate_id = %aggregate_id,
                    version,
                    command_id = %ctx.stream.command_id(),
                    "concurrency conflict"
                );
                ctx.complete(CommitOutcome::Conflict {
                    detail: format!("version {version} of aggregate {aggregate_id} is already committed"),
                });
            }
        }
    }

    async fn committed(&self, ctx: EventCommittingContext<A>, worker: &mut Worker) {
        let EventCommittingContext {
            stream,
            mut aggregate,
            reply,
            ..
        } = ctx;
        let version = stream.version();

        match aggregate.accept_changes(version) {
            Ok(()) => self.cache.update(aggregate.clone()),
            Err(err) => {
                warn!(stream_id = %stream.stream_id(), error = %err, "committed stream does not follow the cached aggregate");
                self.cache.evict(stream.aggregate_id());
            }
        }

        let publisher = self.publisher.clone();
        let published = Arc::new(stream);
        let to_publish = published.clone();
        let publish = worker
            .suspend(self.retry.execute_until_success("publisher.publish", move || {
                let publisher = publisher.clone();
                let stream = to_publish.clone();
                async move { publisher.publish(&stream).await }
            }))
            .await;
        match publish {
            Ok(()) => debug!(stream_id = %published.stream_id(), "stream committed and published"),
            Err(err) => error!(stream_id = %published.stream_id(), error = %err, "stream committed but not published"),
        }

        if self.snapshot_interval > 0 && version % self.snapshot_interval == 0 && aggregate.version() == version {
            if let Err(err) = worker.suspend(self.storage.save_snapshot(&aggregate)).await {
                warn!(aggregate_id = %aggregate.id(), version, error = %err, "snapshot not saved");
            }
        }

        let _ = reply.send(CommitOutcome::Committed { version });
    }
}

#[async_trait]
impl<A: StoredAggregate> MailboxHandler<EventCommittingContext<A>> for EventCommitter<A> {
    async fn handle(
        &self,
        key: &str,
        batch: Vec<EventCommittingContext<A>>,
        worker: &mut Worker,
    ) -> Result<(), EngineError> {
        let (batch, stale): (Vec<_>, Vec<_>) = batch.into_iter().partition(|ctx| !ctx.chain.is_broken());
        for ctx in stale {
            debug!(stream_id = %ctx.stream.stream_id(), "stream staged on a version that was not committed");
            let detail = format!("stream {} follows a stream that was not committed", ctx.stream.stream_id());
            ctx.complete(CommitOutcome::Conflict { detail });
        }
        if batch.is_empty() {
            return Ok(());
        }

        let streams: Vec<EventStream> = batch.iter().map(|ctx| ctx.stream.clone()).collect();
        debug!(mailbox = key, streams = streams.len(), "committing batch");

        let statuses = match self.persist(streams, worker).await {
            Ok(statuses) if statuses.len() == batch.len() => statuses,
            Ok(statuses) => {
                let err = EngineError::Validation(format!(
                    "event store answered {} statuses for {} streams",
                    statuses.len(),
                    batch.len()
                ));
                batch.into_iter().for_each(|ctx| ctx.complete(CommitOutcome::Failed(err.clone())));
                return Err(err);
            }
            Err(err) => {
                batch.into_iter().for_each(|ctx| ctx.complete(CommitOutcome::Failed(err.clone())));
                return Err(err);
            }
        };

        for (ctx, status) in batch.into_iter().zip(statuses) {
            self.settle(ctx, status, worker).await;
        }
        Ok(())
    }
}
