//! Server to client events.
//!
//! Every event travels inside a [`ServerMessage`] envelope that carries the
//! emission timestamp and, once the event has been appended to a session's
//! event log, its sequence id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ImageArtifact;

/// The type of an event, as it appears in the `type` field on the wire and
/// in the `event:` line of an SSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Protocol acknowledgement.
    Ack,
    /// Subscription confirmed after replay.
    Subscribed,
    /// The job entered a new phase.
    Phase,
    /// A tool invocation started.
    ToolStart,
    /// A tool invocation finished.
    ToolEnd,
    /// Textual progress.
    Message,
    /// Status line, including cancellation notices.
    Status,
    /// An image artifact was produced.
    Image,
    /// The job completed successfully.
    Complete,
    /// The job failed, or a request was rejected.
    Error,
    /// Reply to a client ping.
    Pong,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Ack => "ack",
            EventType::Subscribed => "subscribed",
            EventType::Phase => "phase",
            EventType::ToolStart => "tool_start",
            EventType::ToolEnd => "tool_end",
            EventType::Message => "message",
            EventType::Status => "status",
            EventType::Image => "image",
            EventType::Complete => "complete",
            EventType::Error => "error",
            EventType::Pong => "pong",
        }
    }
}

/// Machine-readable classification attached to `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Subscribe targeted an evicted or never-created session. Not retryable.
    SessionNotFound,
    /// The client sent a message the server could not decode.
    ProtocolError,
    /// The job executor raised an error.
    ExecutorFailure,
    /// The session exceeded its wall-clock ceiling.
    Timeout,
    /// The request was well-formed but not acceptable.
    InvalidRequest,
}

/// One observable occurrence during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    /// Acknowledges a client request or a new connection.
    Ack {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Sent after replay when a client resubscribes.
    Subscribed { session_id: String, message: String },
    /// The job moved to a new phase.
    Phase { phase: String, label: String },
    /// A tool invocation started.
    ToolStart {
        tool: String,
        tool_id: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    /// A tool invocation finished.
    ToolEnd { tool_id: String, success: bool },
    /// Free-form progress text.
    Message { text: String },
    /// Status line. Cancellation is reported this way, not as an error.
    Status {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
    },
    /// A produced image artifact.
    ///
    /// The artifact identifier travels as `imageId` because `id` is reserved
    /// for the sequence id of buffered events.
    Image {
        image_id: String,
        url_path: String,
        prompt: String,
        filename: String,
    },
    /// Terminal success. `duration` is in milliseconds.
    Complete {
        session_id: String,
        duration: u64,
        image_count: u32,
        message: String,
    },
    /// Terminal failure, or an unbuffered rejection of a client request.
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
    /// Reply to `ping`.
    Pong,
}

impl Event {
    /// Get the event type.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Ack { .. } => EventType::Ack,
            Event::Subscribed { .. } => EventType::Subscribed,
            Event::Phase { .. } => EventType::Phase,
            Event::ToolStart { .. } => EventType::ToolStart,
            Event::ToolEnd { .. } => EventType::ToolEnd,
            Event::Message { .. } => EventType::Message,
            Event::Status { .. } => EventType::Status,
            Event::Image { .. } => EventType::Image,
            Event::Complete { .. } => EventType::Complete,
            Event::Error { .. } => EventType::Error,
            Event::Pong => EventType::Pong,
        }
    }

    /// Whether this event ends a session: `complete`, `error`, or an
    /// unsuccessful `status` (cancellation).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Complete { .. }
                | Event::Error { .. }
                | Event::Status {
                    success: Some(false),
                    ..
                }
        )
    }

    /// The status event that ends a cancelled session.
    pub fn cancelled() -> Self {
        Event::status("Generation cancelled", Some(false))
    }

    pub fn ack(message: impl Into<String>) -> Self {
        Event::Ack {
            message: message.into(),
            session_id: None,
        }
    }

    pub fn ack_for_session(message: impl Into<String>, session_id: impl Into<String>) -> Self {
        Event::Ack {
            message: message.into(),
            session_id: Some(session_id.into()),
        }
    }

    pub fn phase(phase: impl Into<String>, label: impl Into<String>) -> Self {
        Event::Phase {
            phase: phase.into(),
            label: label.into(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Event::Message { text: text.into() }
    }

    pub fn status(message: impl Into<String>, success: Option<bool>) -> Self {
        Event::Status {
            message: message.into(),
            success,
        }
    }

    pub fn error(error: impl Into<String>, code: ErrorCode) -> Self {
        Event::Error {
            error: error.into(),
            code: Some(code),
        }
    }

    /// Build an `image` event from an artifact description.
    pub fn image(artifact: &ImageArtifact) -> Self {
        Event::Image {
            image_id: artifact.id.clone(),
            url_path: artifact.url_path.clone(),
            prompt: artifact.prompt.clone(),
            filename: artifact.filename.clone(),
        }
    }
}

/// The envelope every server message is sent in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Sequence id, present only for events that went through the event log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl ServerMessage {
    /// Wrap an event that is not part of the replayable sequence.
    pub fn unbuffered(event: Event) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            event,
        }
    }

    /// Serialize to the JSON text sent over the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// An event stored in a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    /// Per-session sequence id, strictly increasing from 1.
    pub id: u64,
    pub event: Event,
    pub timestamp: DateTime<Utc>,
}

impl BufferedEvent {
    /// The envelope sent to clients for this event.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage {
            id: Some(self.id),
            timestamp: self.timestamp,
            event: self.event.clone(),
        }
    }
}
