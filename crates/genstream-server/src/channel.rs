//! Transport-independent handle to one connected client.
//!
//! A [`ClientChannel`] is the sending half used by the multiplexer and the
//! session machinery; the transport (WebSocket writer task or SSE response
//! body) owns the matching [`ChannelReceiver`] and turns [`Outbound`] items
//! into frames.

use futures_util::Stream;
use genstream_types::{Event, ServerMessage};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which transport carries a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    EventStream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::EventStream => write!(f, "sse"),
        }
    }
}

/// An item queued for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close,
}

struct ChannelState {
    paused: bool,
    pending: VecDeque<ServerMessage>,
    session_id: Option<String>,
    abort: Option<CancellationToken>,
    last_activity: Instant,
}

struct Inner {
    id: String,
    kind: TransportKind,
    sender: mpsc::UnboundedSender<Outbound>,
    state: Mutex<ChannelState>,
}

/// Sending side of a client connection. Cheap to clone.
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl ClientChannel {
    /// Create a channel and the receiver its transport drains.
    pub fn new(kind: TransportKind) -> (Self, ChannelReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                sender,
                state: Mutex::new(ChannelState {
                    paused: false,
                    pending: VecDeque::new(),
                    session_id: None,
                    abort: None,
                    last_activity: Instant::now(),
                }),
            }),
        };
        (channel, ChannelReceiver { receiver })
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// Whether the transport side has gone away.
    pub fn is_closed(&self) -> bool {
        self.inner.sender.is_closed()
    }

    /// Deliver a message, honouring the pause flag.
    ///
    /// Returns false if the transport is gone.
    pub fn deliver(&self, message: ServerMessage) -> bool {
        let mut state = self.state();
        if state.paused {
            state.pending.push_back(message);
            return !self.is_closed();
        }
        state.last_activity = Instant::now();
        self.inner.sender.send(Outbound::Message(message)).is_ok()
    }

    /// Send an unbuffered event immediately, bypassing the pause flag.
    pub fn send_direct(&self, event: Event) -> bool {
        self.state().last_activity = Instant::now();
        self.inner
            .sender
            .send(Outbound::Message(ServerMessage::unbuffered(event)))
            .is_ok()
    }

    /// Ask the transport to close the connection.
    pub fn close(&self) {
        let _ = self.inner.sender.send(Outbound::Close);
    }

    pub fn pause(&self) {
        self.state().paused = true;
    }

    /// Clear the pause flag and flush withheld messages in order.
    ///
    /// Returns how many messages were flushed.
    pub fn resume(&self) -> usize {
        let mut state = self.state();
        state.paused = false;
        let flushed = state.pending.len();
        while let Some(message) = state.pending.pop_front() {
            if self.inner.sender.send(Outbound::Message(message)).is_err() {
                state.pending.clear();
                break;
            }
        }
        if flushed > 0 {
            state.last_activity = Instant::now();
        }
        flushed
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Number of messages withheld while paused.
    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    /// Record the session this channel is bound to, with its abort handle.
    pub(crate) fn bind(&self, session_id: &str, abort: Option<CancellationToken>) {
        let mut state = self.state();
        let rebinding = state.session_id.as_deref() != Some(session_id);
        if rebinding || abort.is_some() {
            state.abort = abort;
        }
        state.session_id = Some(session_id.to_string());
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    /// Abort handle captured when the channel was last bound.
    pub fn abort_handle(&self) -> Option<CancellationToken> {
        self.state().abort.clone()
    }

    pub fn touch(&self) {
        self.state().last_activity = Instant::now();
    }

    /// Time since anything was sent on, or received from, this channel.
    pub fn idle_for(&self) -> Duration {
        self.state().last_activity.elapsed()
    }

    pub fn same_as(&self, other: &ClientChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Receiving side of a client connection, drained by the transport.
pub struct ChannelReceiver {
    receiver: mpsc::UnboundedReceiver<Outbound>,
}

impl ChannelReceiver {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.receiver.try_recv().ok()
    }

    /// Messages queued so far, skipping close requests. Test helper.
    pub fn drain_messages(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Some(item) = self.try_recv() {
            if let Outbound::Message(message) = item {
                messages.push(message);
            }
        }
        messages
    }
}

impl Stream for ChannelReceiver {
    type Item = Outbound;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
