use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ordinal_core::{AggregateId, CommandId};

/// Typed body of a command (command abstraction).
///
/// Commands represent **intent** - a request to perform an action on one
/// aggregate. They are **transient** (not persisted) and are transformed into
/// events (which are persisted).
///
/// `command_type()` is the key handlers are registered under, so it must be
/// stable for a given variant.
///
/// ## Design Constraints
///
/// Payloads must be:
/// - **Cloneable**: Commands are copied for conflict retries and logging
/// - **Send + Sync**: Commands cross task boundaries (mailbox runners)
/// - **'static**: Commands don't contain borrowed data (must own all data)
pub trait CommandPayload: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn command_type(&self) -> &'static str;
}

/// Flattened command hierarchy.
///
/// Process-manager commands used to be separate types; they only differ by a
/// couple of optional fields, so they are a discriminator here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    #[default]
    Plain,
    StartProcess { process_id: String },
    CancelProcess { process_id: String },
}

/// A command plus the metadata the runtime routes and retries it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command<P> {
    id: CommandId,
    aggregate_id: Option<AggregateId>,
    kind: CommandKind,
    retry_count: u32,
    metadata: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
    payload: P,
}

impl<P: CommandPayload> Command<P> {
    /// A plain command with a fresh id and no aggregate target.
    pub fn new(payload: P) -> Self {
        Self {
            id: CommandId::new(),
            aggregate_id: None,
            kind: CommandKind::Plain,
            retry_count: 0,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn for_aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn with_id(mut self, id: CommandId) -> Self {
        self.id = id;
        self
    }

    pub fn with_kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn aggregate_id(&self) -> Option<AggregateId> {
        self.aggregate_id
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn command_type(&self) -> &'static str {
        self.payload.command_type()
    }

    /// Mailbox key: the target aggregate, or the command itself.
    ///
    /// Commands without a known aggregate (creations) serialize against
    /// themselves instead of colliding with unrelated creations.
    pub fn routing_key(&self) -> String {
        match self.aggregate_id {
            Some(id) => id.to_string(),
            None => self.id.to_string(),
        }
    }

    /// Count one more concurrency-conflict retry.
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }
}
