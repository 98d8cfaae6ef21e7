//! Engine assembly.
//!
//! Every collaborator is passed in explicitly through [`EngineBuilder`];
//! nothing is discovered. `build` wires the pipelines together and starts
//! the two background loops (retry queue and reaper), so it must run inside
//! a tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use ordinal_core::{AggregateId, AggregateRoot};
use ordinal_events::{
    Command, CommandHandler, CommandHandlerRegistry, CommandPayload, EventHandlerRegistry, EventPublisher, Subscription,
};

use crate::aggregate_storage::{AggregateStorage, StoredAggregate};
use crate::cache::MemoryCache;
use crate::command_pipeline::{
    CommandError, CommandExecutor, CommandMailboxes, CommandMemo, CommandResult, CommandService,
};
use crate::committing::{CommittingMailboxes, EventCommitter};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event_store::EventStore;
use crate::mailbox::{MailboxRegistry, MailboxSettings, WorkerPool};
use crate::processing::EventProcessor;
use crate::published_version::PublishedVersionStore;
use crate::reaper::InactiveReaper;
use crate::retry::RetryService;
use crate::snapshot::{InMemorySnapshotStore, SnapshotStore};

pub struct EngineBuilder<A: StoredAggregate, P: CommandPayload> {
    config: EngineConfig,
    event_store: Option<Arc<dyn EventStore>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    handlers: CommandHandlerRegistry<A, P>,
}

impl<A: StoredAggregate, P: CommandPayload> Default for EngineBuilder<A, P> {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            event_store: None,
            snapshot_store: None,
            publisher: None,
            handlers: CommandHandlerRegistry::new(),
        }
    }
}

impl<A: StoredAggregate, P: CommandPayload> EngineBuilder<A, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_store<S: EventStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.event_store = Some(store);
        self
    }

    /// Defaults to an in-memory store.
    pub fn with_snapshot_store<S: SnapshotStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn with_publisher<B: EventPublisher + 'static>(mut self, publisher: Arc<B>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_handlers(mut self, handlers: CommandHandlerRegistry<A, P>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn register<H>(mut self, command_type: &'static str, handler: H) -> Self
    where
        H: CommandHandler<A, P>,
    {
        self.handlers.register(command_type, handler);
        self
    }

    pub fn build(self) -> Result<Engine<A, P>, EngineError> {
        let config = self.config;
        let store = self
            .event_store
            .ok_or_else(|| EngineError::Validation("engine needs an event store".into()))?;
        let publisher = self
            .publisher
            .ok_or_else(|| EngineError::Validation("engine needs an event publisher".into()))?;
        let snapshots: Arc<dyn SnapshotStore> = match self.snapshot_store {
            Some(snapshots) => snapshots,
            None => Arc::new(InMemorySnapshotStore::new()),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let retry = Arc::new(RetryService::new(&config));
        let cache = Arc::new(MemoryCache::<A>::new(config.aggregate_cache_timeout));
        let storage = Arc::new(AggregateStorage::<A>::new(store.clone(), snapshots, retry.clone()));
        let memo = Arc::new(CommandMemo::new(config.aggregate_cache_timeout));

        let committer = EventCommitter::new(
            store,
            publisher,
            cache.clone(),
            storage.clone(),
            retry.clone(),
            config.snapshot_interval,
        );
        let committing: CommittingMailboxes<A> = MailboxRegistry::new(
            "committing",
            Arc::new(committer),
            WorkerPool::new("committing", config.worker_pool_size),
            MailboxSettings {
                batch_size: config.commit_batch_size,
                run_error_pause: config.run_error_pause,
            },
            config.mailbox_timeout,
        );
        let committing = Arc::new(committing);

        let executor = CommandExecutor::new(
            Arc::new(self.handlers),
            cache.clone(),
            storage.clone(),
            committing.clone(),
            memo.clone(),
            config.max_conflict_retries,
        );
        let command_mailboxes: CommandMailboxes<P> = MailboxRegistry::new(
            "command",
            Arc::new(executor),
            WorkerPool::new("command", config.worker_pool_size),
            MailboxSettings {
                batch_size: config.command_batch_size,
                run_error_pause: config.run_error_pause,
            },
            config.mailbox_timeout,
        );
        let command_mailboxes = Arc::new(command_mailboxes);

        let reaper = Arc::new(InactiveReaper::new());
        reaper.register(command_mailboxes.clone());
        reaper.register(committing);
        reaper.register(cache.clone());
        reaper.register(memo.clone());

        let tasks = vec![
            retry.spawn(shutdown_rx.clone()),
            reaper.spawn(config.scan_interval, shutdown_rx),
        ];

        info!(
            aggregate_type = A::AGGREGATE_TYPE,
            worker_pool_size = config.worker_pool_size,
            commit_batch_size = config.commit_batch_size,
            max_conflict_retries = config.max_conflict_retries,
            "engine started"
        );

        Ok(Engine {
            commands: CommandService::new(command_mailboxes, memo, config.command_timeout),
            config,
            retry,
            cache,
            storage,
            reaper,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

/// A running engine for aggregate type `A` driven by commands with payload `P`.
pub struct Engine<A: StoredAggregate, P: CommandPayload> {
    config: EngineConfig,
    retry: Arc<RetryService>,
    cache: Arc<MemoryCache<A>>,
    storage: Arc<AggregateStorage<A>>,
    commands: CommandService<P>,
    reaper: Arc<InactiveReaper>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: StoredAggregate, P: CommandPayload> Engine<A, P> {
    pub fn builder() -> EngineBuilder<A, P> {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute with the configured `command_timeout`.
    pub async fn execute(&self, command: Command<P>) -> Result<CommandResult, CommandError> {
        self.commands.execute_default(command).await
    }

    pub async fn execute_with_timeout(&self, command: Command<P>, timeout: Duration) -> Result<CommandResult, CommandError> {
        self.commands.execute(command, timeout).await
    }

    /// Fire and forget; the receiver yields the result.
    pub fn send(&self, command: Command<P>) -> oneshot::Receiver<CommandResult> {
        self.commands.send(command)
    }

    pub fn commands(&self) -> &CommandService<P> {
        &self.commands
    }

    pub fn cache(&self) -> &MemoryCache<A> {
        &self.cache
    }

    /// Rebuild an aggregate from storage, bypassing the cache.
    pub async fn load(&self, id: AggregateId) -> Result<Option<AggregateRoot<A>>, EngineError> {
        self.storage.load(id).await
    }

    pub fn retry(&self) -> &Arc<RetryService> {
        &self.retry
    }

    /// A subscriber-side processor sharing this engine's retry queue and reaper.
    pub fn event_processor(
        &self,
        subscriber: &str,
        handlers: EventHandlerRegistry,
        versions: Arc<dyn PublishedVersionStore>,
    ) -> Arc<EventProcessor> {
        let processor = Arc::new(EventProcessor::new(
            subscriber,
            handlers,
            versions,
            self.retry.clone(),
            &self.config,
        ));
        self.reaper.register(processor.mailboxes());
        processor
    }

    /// Drive `subscription` into `processor` until the engine shuts down.
    pub fn subscribe(&self, processor: &Arc<EventProcessor>, subscription: Subscription) {
        let task = processor.spawn_subscription(subscription, self.shutdown.subscribe());
        self.tasks.lock().push(task);
    }

    /// Run one reaper pass now.
    pub fn sweep(&self) -> usize {
        self.reaper.sweep()
    }

    /// Stop the background loops and wait for them. Mailbox runs already in
    /// flight finish on their own.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(aggregate_type = A::AGGREGATE_TYPE, "engine stopped");
    }
}
