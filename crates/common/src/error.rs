//! Common error types for ChatRelay
//!
//! This module defines all error types used across the relay.
//! Every error maps to a stable label used when counting failures.

use thiserror::Error;

/// Main error type for ChatRelay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker connection or channel errors
    #[error("Broker error: {0}")]
    Broker(String),

    /// Record store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Text generation failed or returned nothing usable
    #[error("Generation error: {0}")]
    Generation(String),

    /// Inbound message could not be decoded
    #[error("Malformed message: {0}")]
    Decode(String),

    /// Response could not be published
    #[error("Publish error: {0}")]
    Publish(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Queue full (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<uuid::Error> for RelayError {
    fn from(err: uuid::Error) -> Self {
        RelayError::Config(format!("invalid uuid: {}", err))
    }
}

impl RelayError {
    /// Stable label for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::Broker(_) => "broker",
            RelayError::Store(_) => "store",
            RelayError::Generation(_) => "generation",
            RelayError::Decode(_) => "decode",
            RelayError::Publish(_) => "publish",
            RelayError::Serialization(_) => "serialization",
            RelayError::Io(_) => "io",
            RelayError::Timeout(_) => "timeout",
            RelayError::QueueFull(_) => "queue_full",
            RelayError::Internal(_) => "internal",
        }
    }

    /// Whether the inbound message itself is at fault
    pub fn is_malformed_input(&self) -> bool {
        matches!(self, RelayError::Decode(_))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    /// Create a broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        RelayError::Broker(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        RelayError::Store(msg.into())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        RelayError::Generation(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        RelayError::Decode(msg.into())
    }

    /// Create a publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        RelayError::Publish(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        RelayError::Timeout(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        RelayError::QueueFull(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::Internal(msg.into())
    }
}

/// Result type alias for ChatRelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(RelayError::decode("x").kind(), "decode");
        assert_eq!(RelayError::generation("x").kind(), "generation");
        assert_eq!(RelayError::queue_full("x").kind(), "queue_full");
    }

    #[test]
    fn test_malformed_input_only_for_decode() {
        assert!(RelayError::decode("missing field").is_malformed_input());
        assert!(!RelayError::publish("closed").is_malformed_input());
    }

    #[test]
    fn test_serde_error_converts() {
        let err: RelayError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, RelayError::Serialization(_)));
    }
}
