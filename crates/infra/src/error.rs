//! Runtime error taxonomy.
//!
//! Everything the pipelines can fail with is folded into [`EngineError`] so
//! retry routing is a plain `match`:
//!
//! - `TransientIo` → retried (bounded, then in the background)
//! - `Conflict` → command conflict path (re-execute on a fresh aggregate)
//! - everything else → fail fast

use thiserror::Error;

use ordinal_core::{DomainError, ReplayError};
use ordinal_events::{HandlerError, HandlerLookupError, PublishError};

use crate::event_store::EventStoreError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed command, missing/ambiguous handler, rejected by the domain.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Another writer already committed the version we tried to append.
    #[error("concurrency conflict: {0}")]
    Conflict(String),

    /// Store or transport unreachable; worth retrying.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Stored history is gapped or corrupted.
    #[error("aggregate reconstruction failed: {0}")]
    Reconstruction(String),

    /// The same stream is already pending.
    #[error("duplicate submission: {0}")]
    Duplicate(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientIo(_))
    }
}

impl From<EventStoreError> for EngineError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Io(msg) => EngineError::TransientIo(msg),
            EventStoreError::Validation(msg) => EngineError::Validation(msg),
            EventStoreError::Serialization(msg) => EngineError::Reconstruction(msg),
        }
    }
}

impl From<PublishError> for EngineError {
    fn from(value: PublishError) -> Self {
        EngineError::TransientIo(value.to_string())
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        EngineError::Validation(value.to_string())
    }
}

impl From<ReplayError> for EngineError {
    fn from(value: ReplayError) -> Self {
        EngineError::Reconstruction(value.to_string())
    }
}

impl From<HandlerLookupError> for EngineError {
    fn from(value: HandlerLookupError) -> Self {
        EngineError::Validation(value.to_string())
    }
}

impl From<HandlerError> for EngineError {
    fn from(value: HandlerError) -> Self {
        match value {
            HandlerError::Transient(msg) => EngineError::TransientIo(msg),
            HandlerError::Permanent(msg) => EngineError::Validation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_io_failures_are_transient() {
        assert!(EngineError::from(EventStoreError::Io("down".into())).is_transient());
        assert!(EngineError::from(PublishError::Unavailable("down".into())).is_transient());
        assert!(EngineError::from(HandlerError::Transient("busy".into())).is_transient());

        assert!(!EngineError::Conflict("v2".into()).is_transient());
        assert!(!EngineError::from(DomainError::NotFound).is_transient());
        assert!(!EngineError::from(ReplayError::VersionGap { current: 1, found: 3 }).is_transient());
    }
}
