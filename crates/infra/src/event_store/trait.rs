use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use ordinal_core::{AggregateId, CommandId};
use ordinal_events::EventStream;

/// Outcome of appending one stream.
///
/// Version conflicts are *results*, not errors: the committing pipeline
/// branches on them to hand the command back for a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendStatus {
    /// The stream is now durable.
    Success,
    /// Another stream already occupies this aggregate version.
    VersionConflict,
    /// The originating command already produced a stream for this aggregate.
    DuplicateCommand { version: u64 },
    /// The stream itself is invalid (empty, version gap, type mismatch).
    Rejected { reason: String },
}

/// Event store operation error.
///
/// These are **infrastructure errors** as opposed to domain errors. Version
/// conflicts are reported through [`AppendStatus`] instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Storage unreachable or timed out; the operation may be retried.
    #[error("event store I/O failure: {0}")]
    Io(String),

    /// The request itself is invalid (e.g. querying with the wrong type).
    #[error("invalid request: {0}")]
    Validation(String),

    /// A stored record could not be decoded.
    #[error("stored event could not be decoded: {0}")]
    Serialization(String),
}

/// Append-only store of event streams, one chain of versions per aggregate.
///
/// ## Append Semantics
///
/// `append()`:
/// - Requires `stream.version()` to be exactly `current_version + 1`
/// - Reports `VersionConflict` when the version is already taken
/// - Reports `DuplicateCommand` when the stream's command already committed
/// - Reports `Rejected` for streams that can never be appended
/// - Persists the stream atomically
///
/// `batch_append()` appends several streams (possibly of several aggregates)
/// and reports one status per stream, in input order. Aggregates are judged
/// independently: a conflict on one does not prevent the others from
/// committing. Within one aggregate a stream is only appended when every
/// earlier stream of that aggregate in the batch was; the rest report
/// `VersionConflict`.
///
/// ## Load Semantics
///
/// `query()` returns the streams of one aggregate within an inclusive version
/// range, in version order, or nothing if the aggregate does not exist.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Whether `batch_append` is a real single round-trip.
    fn supports_batch_append(&self) -> bool {
        false
    }

    async fn append(&self, stream: &EventStream) -> Result<AppendStatus, EventStoreError>;

    async fn batch_append(&self, streams: &[EventStream]) -> Result<Vec<AppendStatus>, EventStoreError> {
        let mut halted = Vec::new();
        let mut statuses = Vec::with_capacity(streams.len());
        for stream in streams {
            if halted.contains(&stream.aggregate_id()) {
                statuses.push(AppendStatus::VersionConflict);
                continue;
            }
            let status = self.append(stream).await?;
            if status != AppendStatus::Success {
                halted.push(stream.aggregate_id());
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, EventStoreError>;

    /// The stream committed at `version`, if any.
    async fn find(&self, aggregate_id: AggregateId, version: u64) -> Result<Option<EventStream>, EventStoreError>;

    /// The stream `command_id` committed for this aggregate, if any.
    async fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Result<Option<EventStream>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn supports_batch_append(&self) -> bool {
        (**self).supports_batch_append()
    }

    async fn append(&self, stream: &EventStream) -> Result<AppendStatus, EventStoreError> {
        (**self).append(stream).await
    }

    async fn batch_append(&self, streams: &[EventStream]) -> Result<Vec<AppendStatus>, EventStoreError> {
        (**self).batch_append(streams).await
    }

    async fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, EventStoreError> {
        (**self)
            .query(aggregate_id, aggregate_type, min_version, max_version)
            .await
    }

    async fn find(&self, aggregate_id: AggregateId, version: u64) -> Result<Option<EventStream>, EventStoreError> {
        (**self).find(aggregate_id, version).await
    }

    async fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Result<Option<EventStream>, EventStoreError> {
        (**self).find_by_command(aggregate_id, command_id).await
    }
}
