use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use ordinal_core::EventId;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "note.title_changed").
    ///
    /// Subscriber-side handlers are registered under this name.
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn schema_version(&self) -> u32 {
        1
    }
}

/// A typed event encoded for storage and transport.
///
/// The whole typed event is serialized into `payload`; `event_type` and
/// `schema_version` are lifted out so consumers can dispatch without
/// deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl EventRecord {
    pub fn encode<E>(event: &E) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_id: EventId::new(),
            event_type: event.event_type().to_string(),
            schema_version: event.schema_version(),
            occurred_at: Utc::now(),
            payload: serde_json::to_value(event)?,
        })
    }

    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
