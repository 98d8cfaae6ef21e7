//! `ordinal-infra` — the runtime: per-aggregate mailboxes and the command,
//! committing and delivery pipelines they drive, plus the store boundaries
//! and in-memory stores for tests/dev.

pub mod aggregate_storage;
pub mod cache;
pub mod command_pipeline;
pub mod committing;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_store;
pub mod mailbox;
pub mod processing;
pub mod published_version;
pub mod reaper;
pub mod retry;
pub mod snapshot;

pub use aggregate_storage::{AggregateStorage, StoredAggregate};
pub use cache::MemoryCache;
pub use command_pipeline::{
    CommandError, CommandFailure, CommandResult, CommandService, CommandStatus, FailureKind,
};
pub use committing::{CommitOutcome, EventCommittingContext};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;
pub use event_store::{AppendStatus, EventStore, EventStoreError, InMemoryEventStore};
pub use processing::{EventProcessor, ProcessingEvent};
pub use published_version::{InMemoryPublishedVersionStore, PublishedVersionStore};
pub use retry::RetryService;
pub use snapshot::{InMemorySnapshotStore, Snapshot, SnapshotStore};
