//! `ordinal-events` — message mechanics: commands, event streams, publication
//! and the handler registries the runtime dispatches through.

pub mod bus;
pub mod command;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod stream;

pub use bus::{EventPublisher, PublishError, Subscription};
pub use command::{Command, CommandKind, CommandPayload};
pub use event::{Event, EventRecord};
pub use handler::{
    CommandContext, CommandHandler, CommandHandlerRegistry, EventHandler, EventHandlerRegistry,
    HandlerError, HandlerLookupError,
};
pub use in_memory_bus::InMemoryEventBus;
pub use stream::EventStream;
