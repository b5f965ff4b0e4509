//! Error types for message handling.

use thiserror::Error;

/// Errors that can occur when decoding messages.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The payload is not valid JSON of the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            EventError::InvalidPayload(err.to_string())
        } else {
            EventError::Serialization(err.to_string())
        }
    }
}
