//! Shared fixtures: a small `Note` aggregate and an engine wired to in-memory stores.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ordinal_core::{Aggregate, AggregateId, CommandId, DomainError, DomainResult};
use ordinal_events::{Command, CommandContext, CommandPayload, Event, EventStream, InMemoryEventBus};
use ordinal_infra::aggregate_storage::encode_events;
use ordinal_infra::{Engine, EngineConfig, InMemoryEventStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub title: String,
    pub created: bool,
    pub edits: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoteEvent {
    Created { title: String },
    TitleChanged { title: String },
}

impl Event for NoteEvent {
    fn event_type(&self) -> &'static str {
        match self {
            NoteEvent::Created { .. } => "note.created",
            NoteEvent::TitleChanged { .. } => "note.title_changed",
        }
    }
}

impl Aggregate for Note {
    type Event = NoteEvent;

    const AGGREGATE_TYPE: &'static str = "note";

    fn empty(_id: AggregateId) -> Self {
        Self::default()
    }

    fn apply(&mut self, event: &NoteEvent) {
        match event {
            NoteEvent::Created { title } => {
                self.title = title.clone();
                self.created = true;
            }
            NoteEvent::TitleChanged { title } => {
                self.title = title.clone();
                self.edits += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum NoteCommand {
    Create { title: String },
    ChangeTitle { title: String },
    /// Loads the note and changes nothing.
    Touch,
}

impl CommandPayload for NoteCommand {
    fn command_type(&self) -> &'static str {
        match self {
            NoteCommand::Create { .. } => "note.create",
            NoteCommand::ChangeTitle { .. } => "note.change_title",
            NoteCommand::Touch => "note.touch",
        }
    }
}

pub fn create_note(ctx: &mut CommandContext<Note>, command: &Command<NoteCommand>) -> DomainResult<()> {
    let NoteCommand::Create { title } = command.payload() else {
        return Err(DomainError::validation("expected a create command"));
    };
    if title.trim().is_empty() {
        return Err(DomainError::validation("title must not be empty"));
    }
    let id = command
        .aggregate_id()
        .unwrap_or_else(|| AggregateId::from_uuid(*command.id().as_uuid()));
    ctx.add(id)?.stage(NoteEvent::Created { title: title.clone() });
    Ok(())
}

pub fn change_title(ctx: &mut CommandContext<Note>, command: &Command<NoteCommand>) -> DomainResult<()> {
    let NoteCommand::ChangeTitle { title } = command.payload() else {
        return Err(DomainError::validation("expected a change-title command"));
    };
    let note = ctx.get()?;
    if note.state().title == *title {
        return Ok(());
    }
    note.stage(NoteEvent::TitleChanged { title: title.clone() });
    Ok(())
}

pub fn touch(ctx: &mut CommandContext<Note>, _command: &Command<NoteCommand>) -> DomainResult<()> {
    ctx.get()?;
    Ok(())
}

pub fn create(id: AggregateId, title: &str) -> Command<NoteCommand> {
    Command::new(NoteCommand::Create { title: title.to_string() }).for_aggregate(id)
}

pub fn rename(id: AggregateId, title: impl Into<String>) -> Command<NoteCommand> {
    Command::new(NoteCommand::ChangeTitle { title: title.into() }).for_aggregate(id)
}

/// Short timings so background retries and sweeps happen within a test.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_worker_pool_size(4)
        .with_io_retry(2, Duration::from_millis(5))
        .with_retry_interval(Duration::from_millis(10))
        .with_command_timeout(Duration::from_secs(5))
}

pub struct Harness {
    pub store: Arc<InMemoryEventStore>,
    pub bus: Arc<InMemoryEventBus>,
    pub engine: Engine<Note, NoteCommand>,
}

pub fn harness(config: EngineConfig) -> Harness {
    harness_with_store(Arc::new(InMemoryEventStore::new()), config)
}

pub fn harness_with_store(store: Arc<InMemoryEventStore>, config: EngineConfig) -> Harness {
    ordinal_observability::init_for_tests();
    let bus = Arc::new(InMemoryEventBus::new());
    let engine = Engine::builder()
        .with_config(config)
        .with_event_store(store.clone())
        .with_publisher(bus.clone())
        .register("note.create", create_note)
        .register("note.change_title", change_title)
        .register("note.touch", touch)
        .build()
        .expect("engine builds");
    Harness { store, bus, engine }
}

/// A correctly encoded stream written by someone other than the engine.
pub fn foreign_stream(id: AggregateId, version: u64, events: &[NoteEvent]) -> EventStream {
    let records = encode_events::<Note>(events).expect("note events encode");
    EventStream::new(id, Note::AGGREGATE_TYPE, version, CommandId::new(), records)
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
