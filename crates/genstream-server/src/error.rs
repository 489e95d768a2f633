//! Error types for the session server.

use genstream_types::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur in the session server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// No event log exists for the session: it was never created or has been evicted.
    #[error("Session not found or expired: {0}")]
    SessionNotFound(String),

    /// The client channel is closed.
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Job executor error
    #[error("Executor failed: {0}")]
    Executor(String),

    /// The session hit its wall-clock ceiling
    #[error("Generation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The session was cancelled. Not a failure.
    #[error("Generation cancelled")]
    Cancelled,

    /// Malformed client message
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid request input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Server configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound(session_id.into())
    }

    pub fn channel_unavailable(msg: impl Into<String>) -> Self {
        Self::ChannelUnavailable(msg.into())
    }

    pub fn executor(msg: impl Into<String>) -> Self {
        Self::Executor(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::SessionNotFound(_) => 404,
            ServerError::InvalidInput(_) | ServerError::Protocol(_) | ServerError::Json(_) => 400,
            ServerError::Cancelled => 409,
            ServerError::Executor(_) => 422,
            ServerError::Timeout(_) => 504,
            ServerError::ChannelUnavailable(_) => 503,
            ServerError::Io(_) | ServerError::Config(_) | ServerError::Internal(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::SessionNotFound(_) => "session_not_found",
            ServerError::ChannelUnavailable(_) => "channel_unavailable",
            ServerError::Executor(_) => "executor_failure",
            ServerError::Timeout(_) => "timeout",
            ServerError::Cancelled => "cancelled",
            ServerError::Protocol(_) => "protocol_error",
            ServerError::Json(_) => "json_error",
            ServerError::Io(_) => "io_error",
            ServerError::InvalidInput(_) => "invalid_request",
            ServerError::Config(_) => "config_error",
            ServerError::Internal(_) => "internal_error",
        }
    }

    /// Wire code for errors that are reported to clients as `error` events.
    pub fn wire_code(&self) -> Option<ErrorCode> {
        match self {
            ServerError::SessionNotFound(_) => Some(ErrorCode::SessionNotFound),
            ServerError::Protocol(_) | ServerError::Json(_) => Some(ErrorCode::ProtocolError),
            ServerError::Executor(_) => Some(ErrorCode::ExecutorFailure),
            ServerError::Timeout(_) => Some(ErrorCode::Timeout),
            ServerError::InvalidInput(_) => Some(ErrorCode::InvalidRequest),
            _ => None,
        }
    }
}
