//! Refusals raised by command handlers.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Why a handler refused a command.
///
/// A refusal is final: the engine reports it to the caller and never retries
/// the command. Store and publication failures are not expressed here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The command's input is unacceptable.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The command needs an aggregate the context does not hold.
    #[error("no aggregate loaded for the command")]
    NotFound,

    /// The aggregate's current state rules the command out,
    /// e.g. creating an aggregate that already exists.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Whether the refusal comes from existing state rather than the input.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
