//! Client messages, session descriptions and HTTP payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Messages a client sends over the bidirectional channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Start a new generation.
    Generate {
        #[serde(default)]
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Reattach to an existing session and replay missed events.
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_event_id: Option<u64>,
    },
    /// Cancel the generation bound to this channel.
    Cancel,
    /// Withhold delivery on this channel.
    Pause,
    /// Flush withheld events and resume live delivery.
    Resume,
    /// Application-level keepalive.
    Ping,
}

const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "generate",
    "subscribe",
    "cancel",
    "pause",
    "resume",
    "ping",
];

impl ClientMessage {
    /// Decode a text frame received from a client.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e.to_string()))?;

        let message_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::missing_field("type"))?;

        if !CLIENT_MESSAGE_TYPES.contains(&message_type) {
            return Err(ProtocolError::unknown_type(message_type));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    /// Serialize to the JSON text sent over the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Whether the session has stopped producing events.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// A generated image, as reported by the executor and the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageArtifact {
    pub id: String,
    pub url_path: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub filename: String,
}

impl ImageArtifact {
    pub fn new(id: impl Into<String>, url_path: impl Into<String>) -> Self {
        let url_path = url_path.into();
        let filename = url_path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            id: id.into(),
            url_path,
            prompt: String::new(),
            filename,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }
}

/// Point-in-time view of a session, served by `GET /sessions/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub image_count: u32,
    #[serde(default)]
    pub images: Vec<ImageArtifact>,
    pub latest_event_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `POST /generate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}
