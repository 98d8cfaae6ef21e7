//! Aggregate state + the versioned root that carries it through the runtime.

use thiserror::Error;

use crate::id::AggregateId;

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic** lives in command handlers, which stage events on an
///   [`AggregateRoot`].
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO or side effects. Version tracking is owned
/// by [`AggregateRoot`], not by the state itself.
pub trait Aggregate: Clone + core::fmt::Debug + Send + Sync + 'static {
    type Event: Clone + core::fmt::Debug + Send + Sync + 'static;

    /// Stable aggregate type name (e.g. "note"). Persisted with every stream.
    const AGGREGATE_TYPE: &'static str;

    /// State of a not-yet-created aggregate, used as the replay seed.
    fn empty(id: AggregateId) -> Self;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);
}

/// Replaying a stream onto an aggregate would break its version chain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("stream belongs to aggregate {found}, expected {expected}")]
    AggregateMismatch {
        expected: AggregateId,
        found: AggregateId,
    },

    #[error("stream version {found} does not follow aggregate version {current}")]
    VersionGap { current: u64, found: u64 },
}

/// A live aggregate: identity, committed version, state and staged events.
///
/// `version` is the version of the last *committed* stream. Staged events are
/// applied to `state` immediately but only become part of `version` once the
/// runtime has persisted them and called [`AggregateRoot::accept_changes`].
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    version: u64,
    state: A,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A brand new aggregate at version 0.
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            version: 0,
            state: A::empty(id),
            uncommitted: Vec::new(),
        }
    }

    /// Restore an aggregate from previously captured state (snapshot).
    pub fn restore(id: AggregateId, version: u64, state: A) -> Self {
        Self {
            id,
            version,
            state,
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// Apply `event` to the state and stage it for the next commit.
    pub fn stage(&mut self, event: A::Event) {
        self.state.apply(&event);
        self.uncommitted.push(event);
    }

    pub fn uncommitted(&self) -> &[A::Event] {
        &self.uncommitted
    }

    pub fn has_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Version the staged events will produce once committed.
    pub fn next_version(&self) -> u64 {
        self.version + 1
    }

    /// Mark the staged events as committed at `version`.
    pub fn accept_changes(&mut self, version: u64) -> Result<(), ReplayError> {
        if version != self.version + 1 {
            return Err(ReplayError::VersionGap {
                current: self.version,
                found: version,
            });
        }
        self.uncommitted.clear();
        self.version = version;
        Ok(())
    }

    /// Replay one committed stream.
    ///
    /// The stream must belong to this aggregate and carry exactly
    /// `version + 1`; anything else means the history is gapped or corrupted.
    pub fn replay(
        &mut self,
        aggregate_id: AggregateId,
        version: u64,
        events: &[A::Event],
    ) -> Result<(), ReplayError> {
        if aggregate_id != self.id {
            return Err(ReplayError::AggregateMismatch {
                expected: self.id,
                found: aggregate_id,
            });
        }
        if version != self.version + 1 {
            return Err(ReplayError::VersionGap {
                current: self.version,
                found: version,
            });
        }
        for event in events {
            self.state.apply(event);
        }
        self.version = version;
        Ok(())
    }
}
