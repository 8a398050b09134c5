//! Error types for message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Subscribe error
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Body does not match the stage's payload shape; never redelivered
    #[error("Undecodable message: {0}")]
    Decode(String),

    /// JetStream stream or consumer error
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Timed out waiting for the broker (milliseconds)
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// Transport deliberately offline
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Handler failed; the delivery should be retried
    #[error("Handler error: {0}")]
    Handler(String),
}

impl Error {
    /// True if redelivering the same bytes can never succeed
    pub fn is_poison(&self) -> bool {
        matches!(self, Error::Decode(_))
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
