//! Error types for the session wire protocol.

use thiserror::Error;

/// Errors raised while decoding a message received from a client.
///
/// A protocol error never terminates the connection: the server answers with
/// an unbuffered `error` event and keeps reading.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The payload was not a JSON object with a `type` field.
    #[error("Invalid message format: {message}")]
    Malformed { message: String },

    /// The `type` field named a message the server does not understand.
    #[error("Unknown message type: {message_type}")]
    UnknownType { message_type: String },

    /// A field required by this message type was missing or empty.
    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl ProtocolError {
    /// Create a new malformed-message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Create a new unknown-type error.
    pub fn unknown_type(message_type: impl Into<String>) -> Self {
        Self::UnknownType {
            message_type: message_type.into(),
        }
    }

    /// Create a new missing-field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}

/// Result type for protocol decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
