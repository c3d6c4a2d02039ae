//! Common error types for BatchLoop
//!
//! This module defines all error types used across the BatchLoop system.
//! Every failure an envelope can observe resolves to one of these variants,
//! and the HTTP layer maps each variant onto a status code.

use thiserror::Error;

/// Main error type for BatchLoop
#[derive(Error, Debug)]
pub enum BatchLoopError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload failed schema validation before entering the scheduler
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The user predict routine failed for the batch this request was in
    #[error("Prediction failed: {0}")]
    PredictionFailure(String),

    /// No response was produced within the request timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The server stopped while the request was queued or in flight
    #[error("Server shutting down: {0}")]
    ShutdownInFlight(String),

    /// Queue full (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchLoopError {
    /// Whether the caller, not the server, is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, BatchLoopError::MalformedInput(_))
    }

    /// Whether retrying later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BatchLoopError::QueueFull(_)
                | BatchLoopError::ShutdownInFlight(_)
                | BatchLoopError::Timeout(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BatchLoopError::Config(msg.into())
    }

    /// Create a malformed input error
    pub fn malformed_input(msg: impl Into<String>) -> Self {
        BatchLoopError::MalformedInput(msg.into())
    }

    /// Create a prediction failure
    pub fn prediction(msg: impl Into<String>) -> Self {
        BatchLoopError::PredictionFailure(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        BatchLoopError::Timeout(msg.into())
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        BatchLoopError::ShutdownInFlight(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        BatchLoopError::QueueFull(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        BatchLoopError::Internal(msg.into())
    }
}

/// Result type alias for BatchLoop operations
pub type Result<T> = std::result::Result<T, BatchLoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BatchLoopError::malformed_input("missing field").is_client_error());
        assert!(!BatchLoopError::prediction("boom").is_client_error());
        assert!(BatchLoopError::shutdown("stopping").is_transient());
        assert!(!BatchLoopError::internal("bug").is_transient());
    }

    #[test]
    fn test_serde_error_converts() {
        let err: BatchLoopError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, BatchLoopError::Serialization(_)));
        assert!(err.to_string().starts_with("Serialization error"));
    }
}
