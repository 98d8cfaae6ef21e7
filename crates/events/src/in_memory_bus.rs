//! In-memory event bus for tests/dev.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{EventPublisher, PublishError, Subscription};
use crate::stream::EventStream;

/// In-memory pub/sub bus.
///
/// - No IO
/// - Best-effort fan-out
/// - At-least-once acceptable (subscribers must be idempotent)
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EventStream>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, stream: &EventStream) -> Result<(), PublishError> {
        let mut subs = self.subscribers.lock().map_err(|_| PublishError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(stream.clone()).is_ok());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordinal_core::{AggregateId, CommandId};

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let bus = InMemoryEventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let stream = EventStream::new(AggregateId::new(), "note", 1, CommandId::new(), vec![]);
        bus.publish(&stream).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), stream);
        assert_eq!(second.recv().await.unwrap(), stream);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        drop(bus.subscribe());
        let mut live = bus.subscribe();

        let stream = EventStream::new(AggregateId::new(), "note", 1, CommandId::new(), vec![]);
        bus.publish(&stream).await.unwrap();

        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
        assert!(live.try_recv().is_ok());
    }
}
