//! Error types for the cache.

use thiserror::Error;

/// Main error type for cache operations.
///
/// Errors are `Clone` because a single failure (a failed mutation, an
/// upstream error) is fanned out to every affected subscriber.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Frame protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Mutation {id} failed: {reason}")]
    MutationFailed { id: String, reason: String },

    #[error("Subscriber backlog exceeded limit of {limit}")]
    SlowConsumer { limit: usize },

    #[error("Upstream terminated: {0}")]
    UpstreamTerminated(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl CacheError {
    /// Shorthand used by every single-subscription type.
    pub(crate) fn already_subscribed(what: &str) -> Self {
        CacheError::InvalidState(format!("{what} only supports a single subscription"))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
