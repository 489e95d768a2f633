//! Error types for the session client.

use genstream_types::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The server no longer knows the session. Start over; do not retry.
    #[error("Session not found or expired: {0}")]
    SessionNotFound(String),

    /// Transient network or channel failure.
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response from the server
    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be read or written
    #[error("Session store error: {0}")]
    Store(String),

    /// Status polling reached its limit before the session finished.
    #[error("Gave up polling session {session_id} after {polls} polls")]
    PollLimit { session_id: String, polls: u32 },
}

impl ClientError {
    pub fn channel_unavailable(msg: impl Into<String>) -> Self {
        Self::ChannelUnavailable(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Whether reconnecting may fix this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::ChannelUnavailable(_)
            | ClientError::WebSocket(_)
            | ClientError::Io(_) => true,
            ClientError::Http(e) => e.is_connect() || e.is_timeout(),
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
