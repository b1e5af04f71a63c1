//! Shared error and result types

use thiserror::Error;

/// Errors surfaced directly to callers.
///
/// Protocol and transport failures never appear here; those populate a
/// failure [`Response`](crate::envelope::Response) with a status code, so a
/// handler call that reaches the wire always yields an envelope. `EngineError`
/// covers the cases where no network transaction was attempted at all.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid configuration or caller-supplied argument
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The request queue is at capacity; the submission was rejected
    #[error("request queue full")]
    QueueFull,

    /// A connection registry is at capacity
    #[error("{0} registry full")]
    RegistryFull(&'static str),

    /// The engine has been shut down
    #[error("engine shut down")]
    Shutdown,

    /// Internal failure (task panic, closed channel)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;
