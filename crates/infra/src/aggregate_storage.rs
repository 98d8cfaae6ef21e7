//! Event-sourced aggregate reconstruction.
//!
//! `load` starts from the latest snapshot when there is a usable one and
//! replays only the streams committed after it; otherwise it replays the full
//! history from version 1. Every replayed stream must carry exactly
//! `version + 1` of the aggregate it is applied to. A gap or a foreign
//! stream is a [`EngineError::Reconstruction`], never a silently
//! inconsistent aggregate.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use ordinal_core::{Aggregate, AggregateId, AggregateRoot};
use ordinal_events::{Event, EventRecord, EventStream};

use crate::error::EngineError;
use crate::event_store::EventStore;
use crate::retry::RetryService;
use crate::snapshot::{Snapshot, SnapshotStore};

/// Aggregates the runtime can persist: serializable state and events.
pub trait StoredAggregate:
    Aggregate<Event: Event + Serialize + DeserializeOwned> + Serialize + DeserializeOwned
{
}

impl<T> StoredAggregate for T where
    T: Aggregate<Event: Event + Serialize + DeserializeOwned> + Serialize + DeserializeOwned
{
}

/// Encode staged events for an [`EventStream`].
pub fn encode_events<A: StoredAggregate>(events: &[A::Event]) -> Result<Vec<EventRecord>, EngineError> {
    events
        .iter()
        .map(|event| {
            EventRecord::encode(event)
                .map_err(|e| EngineError::Validation(format!("event '{}' not encodable: {e}", event.event_type())))
        })
        .collect()
}

/// Decode the typed events of a stored stream.
pub fn decode_events<A: StoredAggregate>(stream: &EventStream) -> Result<Vec<A::Event>, EngineError> {
    stream
        .events()
        .iter()
        .map(|record| {
            record.decode::<A::Event>().map_err(|e| {
                EngineError::Reconstruction(format!(
                    "stream {} holds undecodable '{}' event: {e}",
                    stream.stream_id(),
                    record.event_type
                ))
            })
        })
        .collect()
}

/// Replay `streams` (in order) onto `root`.
pub fn replay<A: StoredAggregate>(root: &mut AggregateRoot<A>, streams: &[EventStream]) -> Result<(), EngineError> {
    for stream in streams {
        let events = decode_events::<A>(stream)?;
        root.replay(stream.aggregate_id(), stream.version(), &events)?;
    }
    Ok(())
}

pub struct AggregateStorage<A> {
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    retry: Arc<RetryService>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: StoredAggregate> AggregateStorage<A> {
    pub fn new(events: Arc<dyn EventStore>, snapshots: Arc<dyn SnapshotStore>, retry: Arc<RetryService>) -> Self {
        Self {
            events,
            snapshots,
            retry,
            _aggregate: PhantomData,
        }
    }

    /// Rebuild the aggregate; `None` when it has no history.
    pub async fn load(&self, id: AggregateId) -> Result<Option<AggregateRoot<A>>, EngineError> {
        let mut root = match self.latest_snapshot(id).await? {
            Some(snapshot) => self.restore(snapshot),
            None => AggregateRoot::new(id),
        };

        let events = &self.events;
        let from = root.version() + 1;
        let streams = self
            .retry
            .execute_with_retry("event_store.query", move || {
                events.query(id, A::AGGREGATE_TYPE, from, u64::MAX)
            })
            .await?;

        if root.version() == 0 && streams.is_empty() {
            return Ok(None);
        }

        replay(&mut root, &streams)?;
        debug!(
            aggregate_id = %id,
            aggregate_type = A::AGGREGATE_TYPE,
            version = root.version(),
            replayed = streams.len(),
            "aggregate loaded"
        );
        Ok(Some(root))
    }

    pub async fn save_snapshot(&self, root: &AggregateRoot<A>) -> Result<(), EngineError> {
        let payload = serde_json::to_value(root.state())
            .map_err(|e| EngineError::Validation(format!("aggregate state not serializable: {e}")))?;
        let snapshot = Snapshot::new(root.id(), A::AGGREGATE_TYPE, root.version(), payload);
        let snapshots = &self.snapshots;
        self.retry
            .execute_with_retry("snapshot.save", move || snapshots.save(snapshot.clone()))
            .await
    }

    async fn latest_snapshot(&self, id: AggregateId) -> Result<Option<Snapshot>, EngineError> {
        let snapshots = &self.snapshots;
        self.retry
            .execute_with_retry("snapshot.get_latest", move || {
                snapshots.get_latest(id, A::AGGREGATE_TYPE)
            })
            .await
    }

    /// A snapshot that does not decode is ignored in favour of a full replay.
    fn restore(&self, snapshot: Snapshot) -> AggregateRoot<A> {
        match serde_json::from_value::<A>(snapshot.payload) {
            Ok(state) => AggregateRoot::restore(snapshot.aggregate_id, snapshot.version, state),
            Err(err) => {
                warn!(
                    aggregate_id = %snapshot.aggregate_id,
                    version = snapshot.version,
                    error = %err,
                    "snapshot not decodable, replaying full history"
                );
                AggregateRoot::new(snapshot.aggregate_id)
            }
        }
    }
}
