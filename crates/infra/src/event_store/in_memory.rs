use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use ordinal_core::{AggregateId, CommandId};
use ordinal_events::EventStream;

use super::r#trait::{AppendStatus, EventStore, EventStoreError};

#[derive(Debug, Default)]
struct AggregateStreams {
    aggregate_type: String,
    /// Index `i` holds version `i + 1`.
    streams: Vec<EventStream>,
    by_command: HashMap<CommandId, u64>,
}

impl AggregateStreams {
    fn current_version(&self) -> u64 {
        self.streams.len() as u64
    }
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
///
/// `fail_next(n)` makes the next `n` operations fail with
/// [`EventStoreError::Io`], which is how tests simulate an outage.
#[derive(Debug)]
pub struct InMemoryEventStore {
    aggregates: RwLock<HashMap<AggregateId, AggregateStreams>>,
    batch_append: bool,
    pending_failures: AtomicU32,
    batch_calls: AtomicUsize,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self {
            aggregates: RwLock::new(HashMap::new()),
            batch_append: true,
            pending_failures: AtomicU32::new(0),
            batch_calls: AtomicUsize::new(0),
        }
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that reports no native batch support (streams are appended
    /// one by one by the committing pipeline).
    pub fn without_batch_append() -> Self {
        Self {
            batch_append: false,
            ..Self::default()
        }
    }

    pub fn fail_next(&self, operations: u32) {
        self.pending_failures.store(operations, Ordering::SeqCst);
    }

    /// Number of `batch_append` round-trips served so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Current version of an aggregate (0 when unknown).
    pub fn version_of(&self, aggregate_id: AggregateId) -> u64 {
        self.aggregates
            .read()
            .get(&aggregate_id)
            .map(AggregateStreams::current_version)
            .unwrap_or(0)
    }

    fn injected_failure(&self) -> Result<(), EventStoreError> {
        let consumed = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(EventStoreError::Io("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn append_locked(
        aggregates: &mut HashMap<AggregateId, AggregateStreams>,
        stream: &EventStream,
    ) -> AppendStatus {
        if stream.events().is_empty() {
            return rejected(format!("stream {} has no events", stream.stream_id()));
        }
        if stream.version() == 0 {
            return rejected(format!("stream {} has version 0", stream.stream_id()));
        }

        let entry = aggregates
            .entry(stream.aggregate_id())
            .or_insert_with(|| AggregateStreams {
                aggregate_type: stream.aggregate_type().to_string(),
                ..AggregateStreams::default()
            });

        // Enforce aggregate type stability across the stream.
        if entry.aggregate_type != stream.aggregate_type() {
            return rejected(format!(
                "aggregate type is '{}', attempted append with '{}'",
                entry.aggregate_type,
                stream.aggregate_type()
            ));
        }

        if let Some(version) = entry.by_command.get(&stream.command_id()) {
            return AppendStatus::DuplicateCommand { version: *version };
        }

        let current = entry.current_version();
        if stream.version() <= current {
            return AppendStatus::VersionConflict;
        }
        if stream.version() != current + 1 {
            return rejected(format!(
                "stream {} skips versions (current {current})",
                stream.stream_id()
            ));
        }

        entry.by_command.insert(stream.command_id(), stream.version());
        entry.streams.push(stream.clone());
        AppendStatus::Success
    }
}

fn rejected(reason: String) -> AppendStatus {
    AppendStatus::Rejected { reason }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    fn supports_batch_append(&self) -> bool {
        self.batch_append
    }

    async fn append(&self, stream: &EventStream) -> Result<AppendStatus, EventStoreError> {
        self.injected_failure()?;
        Ok(Self::append_locked(&mut self.aggregates.write(), stream))
    }

    async fn batch_append(&self, streams: &[EventStream]) -> Result<Vec<AppendStatus>, EventStoreError> {
        self.injected_failure()?;
        self.batch_calls.fetch_add(1, Ordering::SeqCst);

        let mut aggregates = self.aggregates.write();
        let mut halted = HashSet::new();
        Ok(streams
            .iter()
            .map(|stream| {
                if halted.contains(&stream.aggregate_id()) {
                    return AppendStatus::VersionConflict;
                }
                let status = Self::append_locked(&mut aggregates, stream);
                if status != AppendStatus::Success {
                    halted.insert(stream.aggregate_id());
                }
                status
            })
            .collect())
    }

    async fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, EventStoreError> {
        self.injected_failure()?;
        let aggregates = self.aggregates.read();

        let Some(entry) = aggregates.get(&aggregate_id) else {
            return Ok(vec![]);
        };
        if entry.aggregate_type != aggregate_type {
            return Err(EventStoreError::Validation(format!(
                "aggregate {aggregate_id} is a '{}', not a '{aggregate_type}'",
                entry.aggregate_type
            )));
        }

        Ok(entry
            .streams
            .iter()
            .filter(|s| s.version() >= min_version && s.version() <= max_version)
            .cloned()
            .collect())
    }

    async fn find(&self, aggregate_id: AggregateId, version: u64) -> Result<Option<EventStream>, EventStoreError> {
        self.injected_failure()?;
        let aggregates = self.aggregates.read();
        Ok(aggregates
            .get(&aggregate_id)
            .and_then(|entry| entry.streams.get(version.checked_sub(1)? as usize))
            .cloned())
    }

    async fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Result<Option<EventStream>, EventStoreError> {
        self.injected_failure()?;
        let aggregates = self.aggregates.read();
        Ok(aggregates.get(&aggregate_id).and_then(|entry| {
            let version = *entry.by_command.get(&command_id)?;
            entry.streams.get(version as usize - 1).cloned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordinal_events::EventRecord;
    use serde_json::json;

    fn stream(aggregate_id: AggregateId, version: u64) -> EventStream {
        let record = EventRecord {
            event_id: ordinal_core::EventId::new(),
            event_type: "note.changed".into(),
            schema_version: 1,
            occurred_at: chrono::Utc::now(),
            payload: json!({ "v": version }),
        };
        EventStream::new(aggregate_id, "note", version, CommandId::new(), vec![record])
    }

    #[tokio::test]
    async fn versions_must_be_contiguous() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        assert_eq!(store.append(&stream(id, 1)).await.unwrap(), AppendStatus::Success);
        assert_eq!(store.append(&stream(id, 1)).await.unwrap(), AppendStatus::VersionConflict);
        assert!(matches!(
            store.append(&stream(id, 3)).await,
            Ok(AppendStatus::Rejected { .. })
        ));
        assert_eq!(store.version_of(id), 1);
    }

    #[tokio::test]
    async fn same_command_reports_duplicate() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let first = stream(id, 1);
        store.append(&first).await.unwrap();

        let again = EventStream::new(id, "note", 2, first.command_id(), first.events().to_vec());
        assert_eq!(
            store.append(&again).await.unwrap(),
            AppendStatus::DuplicateCommand { version: 1 }
        );
        assert_eq!(
            store.find_by_command(id, first.command_id()).await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn batch_append_judges_aggregates_independently() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        store.append(&stream(a, 1)).await.unwrap();

        let statuses = store
            .batch_append(&[stream(a, 1), stream(b, 1), stream(a, 2), stream(b, 2)])
            .await
            .unwrap();

        // a@2 follows a stream that was not appended.
        assert_eq!(
            statuses,
            vec![
                AppendStatus::VersionConflict,
                AppendStatus::Success,
                AppendStatus::VersionConflict,
                AppendStatus::Success
            ]
        );
        assert_eq!(store.version_of(a), 1);
        assert_eq!(store.version_of(b), 2);
        assert_eq!(store.batch_calls(), 1);
    }

    #[tokio::test]
    async fn query_filters_by_range_and_type() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        for v in 1..=4 {
            store.append(&stream(id, v)).await.unwrap();
        }

        let middle = store.query(id, "note", 2, 3).await.unwrap();
        assert_eq!(middle.iter().map(EventStream::version).collect::<Vec<_>>(), vec![2, 3]);
        assert!(store.query(id, "task", 1, u64::MAX).await.is_err());
        assert!(store.query(AggregateId::new(), "note", 1, u64::MAX).await.unwrap().is_empty());
        assert_eq!(store.find(id, 0).await.unwrap(), None);
        assert_eq!(store.find(id, 4).await.unwrap().map(|s| s.version()), Some(4));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryEventStore::new();
        store.fail_next(1);
        let id = AggregateId::new();

        assert!(matches!(store.append(&stream(id, 1)).await, Err(EventStoreError::Io(_))));
        assert_eq!(store.append(&stream(id, 1)).await.unwrap(), AppendStatus::Success);
    }
}
