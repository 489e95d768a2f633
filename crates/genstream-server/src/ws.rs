//! WebSocket transport.
//!
//! Each upgraded socket gets a [`ClientChannel`]. A writer task drains the
//! channel into the socket and sends a ping frame whenever the channel has
//! been idle for the heartbeat interval; the reading side decodes client
//! messages and dispatches them to the registry and multiplexer.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use genstream_types::{ClientMessage, ErrorCode, Event};
use std::time::Duration;

use crate::channel::{ChannelReceiver, ClientChannel, Outbound, TransportKind};
use crate::error::ServerError;
use crate::registry::SessionRegistry;
use crate::AppState;

/// HTTP handler that upgrades the connection to WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry))
}

async fn handle_socket(socket: WebSocket, registry: SessionRegistry) {
    let (channel, receiver) = ClientChannel::new(TransportKind::WebSocket);
    log::info!("WebSocket client connected: {}", channel.id());

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        receiver,
        channel.clone(),
        registry.config().heartbeat_interval,
    ));

    channel.send_direct(Event::ack("Connected to generation server"));

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                channel.touch();
                match ClientMessage::parse(text.as_str()) {
                    Ok(message) => dispatch(&registry, &channel, message),
                    Err(e) => {
                        log::warn!("Malformed message on channel {}: {}", channel.id(), e);
                        channel.send_direct(Event::error(e.to_string(), ErrorCode::ProtocolError));
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                channel.send_direct(Event::error(
                    "Invalid message format: binary frames are not supported",
                    ErrorCode::ProtocolError,
                ));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => channel.touch(),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                log::debug!("WebSocket receive error on channel {}: {}", channel.id(), e);
                break;
            }
        }
    }

    registry.multiplexer().detach(&channel);
    writer.abort();
    log::info!("WebSocket client disconnected: {}", channel.id());
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: ChannelReceiver,
    channel: ClientChannel,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            item = receiver.recv() => match item {
                Some(Outbound::Message(message)) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("Failed to serialize server message: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        log::debug!("WebSocket sink closed for channel {}", channel.id());
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if channel.idle_for() >= heartbeat {
                    log::trace!("Heartbeat ping on channel {}", channel.id());
                    channel.touch();
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Act on one decoded client message.
pub fn dispatch(registry: &SessionRegistry, channel: &ClientChannel, message: ClientMessage) {
    let multiplexer = registry.multiplexer();

    match message {
        ClientMessage::Generate { prompt, session_id } => {
            if let Err(e) = registry.start_generation(&prompt, session_id, Some(channel)) {
                log::warn!("Generate rejected on channel {}: {}", channel.id(), e);
                reject(channel, &e);
            }
        }
        ClientMessage::Subscribe {
            session_id,
            last_event_id,
        } => {
            let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
                channel.send_direct(Event::error(
                    "Session ID required for subscribe",
                    ErrorCode::InvalidRequest,
                ));
                return;
            };
            let last_event_id = last_event_id.unwrap_or(0);
            if let Err(e) = multiplexer.subscribe(channel, &session_id, last_event_id) {
                reject(channel, &e);
            }
        }
        ClientMessage::Cancel => {
            multiplexer.cancel(channel);
        }
        ClientMessage::Pause => multiplexer.pause(channel),
        ClientMessage::Resume => {
            multiplexer.resume(channel);
        }
        ClientMessage::Ping => {
            channel.send_direct(Event::Pong);
        }
    }
}

fn reject(channel: &ClientChannel, error: &ServerError) {
    let event = match error {
        ServerError::SessionNotFound(_) => {
            Event::error("Session not found or expired", ErrorCode::SessionNotFound)
        }
        other => Event::Error {
            error: other.to_string(),
            code: other.wire_code(),
        },
    };
    channel.send_direct(event);
}
