use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ordinal_core::{AggregateId, CommandId, stream_id};

use crate::event::EventRecord;

/// The events one command produced for one aggregate.
///
/// This is the unit the runtime appends, publishes and delivers.
///
/// Notes:
/// - **Immutable**: fields are only readable once constructed.
/// - All events of a stream share `version`, the aggregate version the stream
///   produces.
/// - `stream_id()` (`"{aggregate_id}_{version}"`) identifies the slot the
///   stream occupies; two writers racing for one version share it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStream {
    aggregate_id: AggregateId,
    aggregate_type: String,
    version: u64,
    command_id: CommandId,
    timestamp: DateTime<Utc>,
    events: Vec<EventRecord>,
}

impl EventStream {
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: u64,
        command_id: CommandId,
        events: Vec<EventRecord>,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            command_id,
            timestamp: Utc::now(),
            events,
        }
    }

    pub fn stream_id(&self) -> String {
        stream_id(self.aggregate_id, self.version)
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }
}
