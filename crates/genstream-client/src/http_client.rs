use async_stream::stream;
use futures_util::stream::{Stream, TryStreamExt};
use genstream_types::{GenerateRequest, ServerMessage, SessionSnapshot};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;

use crate::error::{ClientError, Result};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ServerMessage>> + Send>>;

/// HTTP client for the session server's request/response and SSE endpoints
#[derive(Debug, Clone)]
pub struct HttpClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Timeout for plain requests. Event streams are not subject to it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health_check(&self) -> Result<()> {
        let health_url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&health_url)
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(response, None).await?;
        Ok(())
    }

    /// Read a session snapshot from `GET /sessions/{id}`.
    pub async fn status(&self, session_id: &str) -> Result<SessionSnapshot> {
        let url = format!("{}/sessions/{}", self.base_url, session_id);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?;
        let response = check_status(response, Some(session_id)).await?;
        Ok(response.json().await?)
    }

    pub async fn list(&self) -> Result<Vec<SessionSnapshot>> {
        let url = format!("{}/sessions", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?;
        let body: Value = check_status(response, None).await?.json().await?;
        Ok(serde_json::from_value(
            body.get("sessions").cloned().unwrap_or(Value::Array(Vec::new())),
        )?)
    }

    /// Request cancellation. Returns whether a running job was signalled.
    pub async fn cancel(&self, session_id: &str) -> Result<bool> {
        let url = format!("{}/sessions/{}/cancel", self.base_url, session_id);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .send()
            .await?;
        let body: Value = check_status(response, Some(session_id)).await?.json().await?;
        Ok(body.get("cancelled").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Start a job and stream its events over SSE.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<EventStream> {
        let url = format!("{}/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;
        let response = check_status(response, request.session_id.as_deref()).await?;
        Ok(event_stream(response))
    }

    /// Resume a session's SSE stream after `last_event_id`.
    pub async fn resume(&self, session_id: &str, last_event_id: u64) -> Result<EventStream> {
        let url = format!("{}/sessions/{}/events", self.base_url, session_id);
        let response = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream")
            .header("Last-Event-ID", last_event_id.to_string())
            .send()
            .await?;
        let response = check_status(response, Some(session_id)).await?;
        Ok(event_stream(response))
    }
}

async fn check_status(
    response: reqwest::Response,
    session_id: Option<&str>,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        if let Some(session_id) = session_id {
            return Err(ClientError::SessionNotFound(session_id.to_string()));
        }
    }
    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}

fn event_stream(response: reqwest::Response) -> EventStream {
    let stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()));

    let mut lines_reader = StreamReader::new(stream).lines();

    Box::pin(stream! {
        let mut parser = SseParser::default();
        loop {
            let line = match lines_reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    yield Err(ClientError::from(e));
                    break;
                }
            };
            if let Some(data) = parser.push_line(&line) {
                match ServerMessage::from_json(&data) {
                    Ok(message) => yield Ok(message),
                    Err(e) => log::warn!("Ignoring undecodable SSE event: {}", e),
                }
            }
        }
    })
}

/// Accumulates SSE lines into complete event payloads.
#[derive(Debug, Default)]
struct SseParser {
    data: String,
}

impl SseParser {
    /// Feed one line; returns the event data once a blank line ends an event.
    fn push_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data));
        }
        // Comments carry keepalives; `event:` and `id:` are repeated in the JSON.
        if let Some(data) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(data.strip_prefix(' ').unwrap_or(data));
        }
        None
    }
}
