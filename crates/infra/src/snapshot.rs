//! Aggregate snapshots.
//!
//! A snapshot captures the serialized state of an aggregate at one version so
//! reconstruction only has to replay the streams committed after it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use ordinal_core::AggregateId;

use crate::event_store::EventStoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: u64,
    pub payload: JsonValue,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(aggregate_id: AggregateId, aggregate_type: impl Into<String>, version: u64, payload: JsonValue) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            payload,
            taken_at: Utc::now(),
        }
    }
}

/// Latest-snapshot-per-aggregate storage.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_latest(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, EventStoreError>;

    /// Store `snapshot`; an older snapshot never replaces a newer one.
    async fn save(&self, snapshot: Snapshot) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    async fn get_latest(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        (**self).get_latest(aggregate_id, aggregate_type).await
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        (**self).save(snapshot).await
    }
}

/// In-memory snapshot store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<(AggregateId, String), Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get_latest(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        Ok(self
            .snapshots
            .read()
            .get(&(aggregate_id, aggregate_type.to_string()))
            .cloned())
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        let key = (snapshot.aggregate_id, snapshot.aggregate_type.clone());
        let mut snapshots = self.snapshots.write();
        match snapshots.get(&key) {
            Some(existing) if existing.version >= snapshot.version => {}
            _ => {
                snapshots.insert(key, snapshot);
            }
        }
        Ok(())
    }
}
