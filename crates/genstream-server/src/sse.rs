//! Server-Sent Events (SSE) transport.
//!
//! The one-directional counterpart of the WebSocket transport. Buffered events
//! carry their sequence id in the `id:` field, so browsers and the HTTP client
//! can resume with `Last-Event-ID`.

use axum::response::sse::{Event as AxumEvent, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::Stream;
use genstream_types::ServerMessage;
use pin_project_lite::pin_project;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::channel::{ChannelReceiver, ClientChannel, Outbound};
use crate::error::{Result, ServerError};
use crate::registry::SessionRegistry;

/// An SSE event that can be sent to clients.
#[derive(Debug, Clone)]
pub struct SseEvent {
    /// Event type (optional)
    pub event_type: Option<String>,
    /// Event data
    pub data: String,
    /// Event ID (optional)
    pub id: Option<String>,
}

impl SseEvent {
    /// Create a new SSE event with event type and data.
    pub fn with_type(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            data: data.into(),
            id: None,
        }
    }

    /// Set the event ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Create an SSE event from a server message.
    pub fn from_message(message: &ServerMessage) -> Result<Self> {
        let data = serde_json::to_string(message).map_err(ServerError::Json)?;
        let event = Self::with_type(message.event.event_type().as_str(), data);
        Ok(match message.id {
            Some(id) => event.with_id(id.to_string()),
            None => event,
        })
    }
}

impl From<SseEvent> for AxumEvent {
    fn from(event: SseEvent) -> Self {
        let mut axum_event = AxumEvent::default().data(event.data);

        if let Some(event_type) = event.event_type {
            axum_event = axum_event.event(event_type);
        }

        if let Some(id) = event.id {
            axum_event = axum_event.id(id);
        }

        axum_event
    }
}

/// Detaches the channel when the SSE response body is dropped.
pub struct DisconnectGuard {
    registry: SessionRegistry,
    channel: ClientChannel,
    cancel_session: bool,
}

impl DisconnectGuard {
    pub fn new(registry: SessionRegistry, channel: ClientChannel) -> Self {
        let cancel_session = registry.config().cancel_on_stream_disconnect;
        Self {
            registry,
            channel,
            cancel_session,
        }
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.registry.multiplexer().detach(&self.channel);
        if self.cancel_session {
            if let Some(session_id) = self.channel.session_id() {
                if self.registry.cancel_session(&session_id) {
                    log::info!(
                        "SSE stream for session {} dropped, generation cancelled",
                        session_id
                    );
                }
            }
        }
    }
}

pin_project! {
    /// A stream wrapper that converts channel output to SSE events.
    ///
    /// Ends after forwarding the session's terminal event.
    pub struct SseStream<S> {
        #[pin]
        inner: S,
        finished: bool,
        guard: Option<DisconnectGuard>,
    }
}

impl<S> SseStream<S> {
    /// Create a new SSE stream wrapper.
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            finished: false,
            guard: None,
        }
    }

    /// Attach a guard that runs when the stream is dropped.
    pub fn with_guard(mut self, guard: DisconnectGuard) -> Self {
        self.guard = Some(guard);
        self
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Outbound>,
{
    type Item = std::result::Result<AxumEvent, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Outbound::Message(message))) => {
                if message.id.is_some() && message.event.is_terminal() {
                    *this.finished = true;
                }
                match SseEvent::from_message(&message) {
                    Ok(sse_event) => Poll::Ready(Some(Ok(sse_event.into()))),
                    Err(e) => {
                        log::error!("Failed to convert server message to SSE: {}", e);
                        let error_event = SseEvent::with_type(
                            "error",
                            format!(r#"{{"error": "Failed to serialize event: {}"}}"#, e),
                        );
                        Poll::Ready(Some(Ok(error_event.into())))
                    }
                }
            }
            Poll::Ready(Some(Outbound::Close)) | Poll::Ready(None) => {
                *this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create an SSE response streaming a client channel.
pub fn channel_response(
    registry: SessionRegistry,
    channel: ClientChannel,
    receiver: ChannelReceiver,
) -> Response {
    let keepalive = registry.config().sse_keepalive_interval;
    let stream = SseStream::new(receiver).with_guard(DisconnectGuard::new(registry, channel));
    create_sse_response_with_keepalive(stream, keepalive, "keep-alive")
}

/// Create an SSE response with custom keep-alive settings.
pub fn create_sse_response_with_keepalive<S>(
    stream: S,
    keepalive_interval: Duration,
    keepalive_text: impl Into<String>,
) -> Response
where
    S: Stream<Item = std::result::Result<AxumEvent, Infallible>> + Send + 'static,
{
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(keepalive_interval)
                .text(keepalive_text.into()),
        )
        .into_response()
}
