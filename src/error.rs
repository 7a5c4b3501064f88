//! Error taxonomy for the dispatch engine.
//!
//! Per-item failures inside a fan-out are collected into reports rather than
//! returned through these types; an `Err` from an engine entry point means
//! the whole operation could not run.

use thiserror::Error;

/// Errors surfaced by the engine to the surrounding service layer.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// A referenced hook, command, cron job, module, installation, player or
    /// server does not exist in the tenant's scope.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// The game connection could not be established or probed.
    #[error("game server unreachable: {0}")]
    Unreachable(String),

    /// Unsafe regex, invalid cron pattern or malformed argument declaration.
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    /// A schedule key was found in a state the operation did not expect.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A collaborator failed in an unexpected way.
    #[error("internal error: {0}")]
    Internal(String),

    /// The work queue rejected or failed an operation.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Errors raised by [`crate::queue::WorkQueue`] implementations.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Redis(String),

    #[error("queue serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}
