//! Push channel abstraction and its WebSocket implementation.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use genstream_types::{ClientMessage, ServerMessage};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ClientError, Result};

/// What a connection produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(ServerMessage),
    /// The connection ended. `code` is the close code if the peer sent one.
    Closed { code: Option<u16> },
}

/// Opens connections to the session server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// One live bidirectional connection.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Next server message. Read failures are reported as `Closed`.
    async fn recv(&mut self) -> Incoming;

    /// Close cleanly, with code 1000.
    async fn close(&mut self) -> Result<()>;
}

/// WebSocket transport against the server's `/ws` endpoint.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Derive the WebSocket URL from an HTTP base URL.
    pub fn from_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        Self::new(format!("{}/ws", ws_base))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            ClientError::channel_unavailable(format!("Failed to connect to {}: {}", self.url, e))
        })?;
        log::debug!("Connected to {}", self.url);
        Ok(Box::new(WsConnection { stream }))
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Incoming {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match ServerMessage::from_json(text.as_str()) {
                    Ok(message) => return Incoming::Message(message),
                    Err(e) => log::warn!("Ignoring undecodable server message: {}", e),
                },
                Ok(Message::Close(frame)) => {
                    return Incoming::Closed {
                        code: frame.map(|f| u16::from(f.code)),
                    }
                }
                // Pings are answered by tungstenite on the next read or write.
                Ok(_) => {}
                Err(e) => {
                    log::debug!("WebSocket read failed: {}", e);
                    break;
                }
            }
        }
        Incoming::Closed { code: None }
    }

    async fn close(&mut self) -> Result<()> {
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client closed".into(),
            }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_from_base() {
        assert_eq!(
            WsTransport::from_base_url("http://127.0.0.1:3001/").url(),
            "ws://127.0.0.1:3001/ws"
        );
        assert_eq!(
            WsTransport::from_base_url("https://gen.example.com").url(),
            "wss://gen.example.com/ws"
        );
    }
}
