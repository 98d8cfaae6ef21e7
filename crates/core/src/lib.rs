//! `ordinal-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ReplayError};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, CommandId, EventId, stream_id};
