//! Published-version checkpoints.
//!
//! Tracks, per (subscriber, aggregate), the last stream version whose events
//! were fully handled. This enables:
//! - Idempotent delivery (versions <= checkpoint are dropped)
//! - Resume after restart (the ordered mailbox starts from the checkpoint)

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use ordinal_core::AggregateId;

use crate::event_store::EventStoreError;

#[async_trait]
pub trait PublishedVersionStore: Send + Sync {
    /// Last handled version, 0 when the subscriber never saw the aggregate.
    async fn get(
        &self,
        subscriber: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, EventStoreError>;

    async fn update(
        &self,
        subscriber: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        version: u64,
    ) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> PublishedVersionStore for Arc<S>
where
    S: PublishedVersionStore + ?Sized,
{
    async fn get(
        &self,
        subscriber: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, EventStoreError> {
        (**self).get(subscriber, aggregate_type, aggregate_id).await
    }

    async fn update(
        &self,
        subscriber: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        version: u64,
    ) -> Result<(), EventStoreError> {
        (**self)
            .update(subscriber, aggregate_type, aggregate_id, version)
            .await
    }
}

type CheckpointKey = (String, String, AggregateId);

/// In-memory checkpoint store (tests/dev). Checkpoints never move backwards.
#[derive(Debug, Default)]
pub struct InMemoryPublishedVersionStore {
    versions: RwLock<HashMap<CheckpointKey, u64>>,
}

impl InMemoryPublishedVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublishedVersionStore for InMemoryPublishedVersionStore {
    async fn get(
        &self,
        subscriber: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, EventStoreError> {
        let key = (subscriber.to_string(), aggregate_type.to_string(), aggregate_id);
        Ok(self.versions.read().get(&key).copied().unwrap_or(0))
    }

    async fn update(
        &self,
        subscriber: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        version: u64,
    ) -> Result<(), EventStoreError> {
        let key = (subscriber.to_string(), aggregate_type.to_string(), aggregate_id);
        let mut versions = self.versions.write();
        let current = versions.entry(key).or_insert(0);
        *current = (*current).max(version);
        Ok(())
    }
}
