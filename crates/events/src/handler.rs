//! Handler contracts and the explicit registries that resolve them.
//!
//! Handlers are registered once at startup under a message type name; the
//! runtime looks them up at dispatch time. There is no discovery: whatever
//! was not registered does not exist.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use ordinal_core::{Aggregate, AggregateId, AggregateRoot, CommandId, DomainError, DomainResult};

use crate::command::Command;
use crate::event::EventRecord;
use crate::stream::EventStream;

/// What a command handler sees of the aggregate it works on.
///
/// The runtime loads the target aggregate (if any) before calling the
/// handler. The handler either mutates it through [`CommandContext::get`] or,
/// for creations, starts a new one with [`CommandContext::add`]. Staged events
/// on the resulting root become the command's event stream.
#[derive(Debug)]
pub struct CommandContext<A: Aggregate> {
    command_id: CommandId,
    aggregate: Option<AggregateRoot<A>>,
    existed: bool,
}

impl<A: Aggregate> CommandContext<A> {
    pub fn new(command_id: CommandId, loaded: Option<AggregateRoot<A>>) -> Self {
        let existed = loaded.is_some();
        Self {
            command_id,
            aggregate: loaded,
            existed,
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// The loaded aggregate.
    pub fn get(&mut self) -> DomainResult<&mut AggregateRoot<A>> {
        self.aggregate.as_mut().ok_or_else(DomainError::not_found)
    }

    /// Start a new aggregate; fails when one was already loaded or added.
    pub fn add(&mut self, id: AggregateId) -> DomainResult<&mut AggregateRoot<A>> {
        if let Some(existing) = &self.aggregate {
            return Err(DomainError::conflict(format!(
                "aggregate {} already exists",
                existing.id()
            )));
        }
        Ok(self.aggregate.insert(AggregateRoot::new(id)))
    }

    /// Whether the aggregate was loaded from cache/storage (vs. added).
    pub fn existed(&self) -> bool {
        self.existed
    }

    pub fn into_aggregate(self) -> Option<AggregateRoot<A>> {
        self.aggregate
    }
}

/// Handles one command type for aggregate `A` (pure decision logic).
///
/// Handlers must be deterministic and side-effect free: they stage events on
/// the aggregate and return. Persistence, publication and retries are the
/// runtime's job.
pub trait CommandHandler<A: Aggregate, P>: Send + Sync + 'static {
    fn handle(&self, ctx: &mut CommandContext<A>, command: &Command<P>) -> DomainResult<()>;
}

impl<A, P, F> CommandHandler<A, P> for F
where
    A: Aggregate,
    F: Fn(&mut CommandContext<A>, &Command<P>) -> DomainResult<()> + Send + Sync + 'static,
{
    fn handle(&self, ctx: &mut CommandContext<A>, command: &Command<P>) -> DomainResult<()> {
        self(ctx, command)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerLookupError {
    #[error("no handler registered for command type '{0}'")]
    Missing(String),

    #[error("{count} handlers registered for command type '{command_type}', expected exactly one")]
    Ambiguous { command_type: String, count: usize },
}

/// Startup-time mapping from command type to its handler.
///
/// Registration never fails; ambiguity is reported when the command type is
/// dispatched, so a misconfigured registry fails the affected commands
/// instead of the whole process.
pub struct CommandHandlerRegistry<A: Aggregate, P> {
    handlers: HashMap<&'static str, Vec<Arc<dyn CommandHandler<A, P>>>>,
}

impl<A: Aggregate, P> Default for CommandHandlerRegistry<A, P> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<A: Aggregate, P: 'static> CommandHandlerRegistry<A, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, command_type: &'static str, handler: H) -> &mut Self
    where
        H: CommandHandler<A, P>,
    {
        self.handlers
            .entry(command_type)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    pub fn resolve(&self, command_type: &str) -> Result<Arc<dyn CommandHandler<A, P>>, HandlerLookupError> {
        match self.handlers.get(command_type).map(Vec::as_slice) {
            None | Some([]) => Err(HandlerLookupError::Missing(command_type.to_string())),
            Some([handler]) => Ok(handler.clone()),
            Some(many) => Err(HandlerLookupError::Ambiguous {
                command_type: command_type.to_string(),
                count: many.len(),
            }),
        }
    }
}

/// Failure reported by an event handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Infrastructure hiccup; the runtime retries until it succeeds.
    #[error("transient handler failure: {0}")]
    Transient(String),

    /// Programming or data error; retrying would not help.
    #[error("handler failure: {0}")]
    Permanent(String),
}

/// Reacts to one committed event (side effects: read models, notifications...).
///
/// Delivery is ordered per aggregate and at-least-once across restarts, so
/// handlers should tolerate seeing an event again after a crash.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    async fn handle(&self, stream: &EventStream, event: &EventRecord) -> Result<(), HandlerError>;
}

/// Startup-time mapping from event type to its handlers, in registration order.
#[derive(Default)]
pub struct EventHandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl EventHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.entry(event_type.into()).or_default().push(handler);
        self
    }

    pub fn handlers_for(&self, event_type: &str) -> &[Arc<dyn EventHandler>] {
        self.handlers.get(event_type).map(Vec::as_slice).unwrap_or(&[])
    }
}
