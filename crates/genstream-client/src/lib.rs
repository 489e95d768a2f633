//! Client SDK for following long-running generation sessions
//!
//! A generation job outlives the connection that started it, so the client's
//! job is to stay attached to it: persist the session and the last sequence id
//! it has seen, reconnect with backoff when the push channel drops, resubscribe
//! from that id, and fall back to status polling when the channel cannot be
//! re-established. [`Reconnector`] does all of that over any [`Transport`];
//! [`WsTransport`] is the WebSocket implementation. [`HttpClient`] covers the
//! one-directional SSE endpoints and the status, list and cancel requests.

pub mod backoff;
pub mod error;
pub mod http_client;
pub mod poller;
pub mod reconnector;
pub mod store;
pub mod transport;

pub use backoff::{PollPolicy, ReconnectPolicy};
pub use error::{ClientError, Result};
pub use http_client::{EventStream, HttpClient};
pub use poller::{StatusPoller, StatusSource};
pub use reconnector::{
    ClientEvent, ClientOutcome, ConnectionState, Reconnector, ReconnectorHandle,
    DEFAULT_PING_INTERVAL,
};
pub use store::{FileSessionStore, MemorySessionStore, PersistedSession, SessionStore};
pub use transport::{Connection, Incoming, Transport, WsTransport};

pub use genstream_types::{ClientMessage, Event, ServerMessage, SessionSnapshot, SessionStatus};

use std::sync::Arc;

/// Build a reconnector for a server at `base_url` using WebSocket for the
/// push channel and the HTTP status endpoint for the polling fallback.
pub fn connect_to(
    base_url: &str,
    store: Arc<dyn SessionStore>,
) -> (Reconnector, tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) {
    let transport = Arc::new(WsTransport::from_base_url(base_url));
    let http = Arc::new(HttpClient::new(base_url));
    let (reconnector, events) = Reconnector::new(transport, store);
    (reconnector.with_status_source(http), events)
}
