//! Event publishing/subscription abstraction (mechanics only).
//!
//! Committed streams are handed to an [`EventPublisher`] after the event
//! store accepted them. The publisher is the **transport layer**:
//!
//! ```text
//! Command → Event Store (append stream) → Publisher → Subscribers
//!                                                        └─ EventProcessor (ordered per aggregate)
//! ```
//!
//! - **Transport-agnostic**: in-memory channels, a broker, etc.
//! - **At-least-once delivery**: streams may be delivered more than once and
//!   out of order; the subscriber side restores per-aggregate version order
//!   and drops duplicates.
//! - **No persistence**: the event store is the source of truth.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::stream::EventStream;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The transport could not be reached; publication may be retried.
    #[error("publisher unavailable: {0}")]
    Unavailable(String),

    /// Publish failed due to internal lock poisoning.
    #[error("publisher state poisoned")]
    Poisoned,
}

/// Publishes committed streams to zero or more subscribers.
///
/// `publish()` can fail (e.g. broker unreachable). Since the stream is
/// already persisted, retrying publication is safe.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, stream: &EventStream) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(&self, stream: &EventStream) -> Result<(), PublishError> {
        (**self).publish(stream).await
    }
}

/// A subscription to published streams.
///
/// Each subscription gets a copy of every published stream (broadcast
/// semantics). Designed for a single consuming task.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<EventStream>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<EventStream>) -> Self {
        Self { receiver }
    }

    /// Wait for the next stream; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventStream> {
        self.receiver.recv().await
    }

    /// Try to receive a stream without waiting.
    pub fn try_recv(&mut self) -> Result<EventStream, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}
