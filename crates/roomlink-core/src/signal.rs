//! Signaling link between a client and the relay.
//!
//! [`RelayLink`] talks to an in-process dispatcher; `WsLink` (feature `ws`)
//! talks to a remote relay server over its WebSocket.

use crate::error::NegotiationError;
use async_trait::async_trait;
use roomlink_relay::{ClientMessage, RelayConnection, ServerMessage};

/// Bidirectional message link to the relay
#[async_trait]
pub trait SignalLink: Send {
    /// Send a message to the relay
    async fn send(&mut self, message: ClientMessage) -> Result<(), NegotiationError>;

    /// Next message from the relay; `None` once the link is closed
    async fn recv(&mut self) -> Option<ServerMessage>;

    /// Close the link, leaving any room it joined
    async fn close(&mut self);
}

/// Link over a connection registered with an in-process relay dispatcher
pub struct RelayLink {
    connection: Option<RelayConnection>,
}

impl RelayLink {
    /// Wrap a registered connection
    #[must_use]
    pub fn new(connection: RelayConnection) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    /// Whether the link is still open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }
}

#[async_trait]
impl SignalLink for RelayLink {
    async fn send(&mut self, message: ClientMessage) -> Result<(), NegotiationError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(NegotiationError::SignalingClosed)?;
        connection
            .send(message)
            .map_err(|_| NegotiationError::SignalingClosed)
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        match self.connection.as_mut() {
            Some(connection) => connection.recv().await,
            None => None,
        }
    }

    async fn close(&mut self) {
        // Dropping the connection disconnects it from the dispatcher
        self.connection = None;
    }
}

#[cfg(feature = "ws")]
pub use ws::WsLink;

#[cfg(feature = "ws")]
mod ws {
    use super::SignalLink;
    use crate::error::NegotiationError;
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use roomlink_relay::{ClientMessage, ServerMessage};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
    use tracing::{debug, warn};

    type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Link to a relay server over its signaling WebSocket
    pub struct WsLink {
        stream: Option<Stream>,
    }

    impl WsLink {
        /// Connect to `url`, e.g. `ws://127.0.0.1:5000/ws`
        ///
        /// # Errors
        ///
        /// Returns [`NegotiationError::Relay`] if the handshake fails.
        pub async fn connect(url: &str) -> Result<Self, NegotiationError> {
            let (stream, _) = connect_async(url)
                .await
                .map_err(|e| NegotiationError::Relay(format!("connect {url}: {e}")))?;
            debug!("Signaling link open to {}", url);
            Ok(Self {
                stream: Some(stream),
            })
        }
    }

    #[async_trait]
    impl SignalLink for WsLink {
        async fn send(&mut self, message: ClientMessage) -> Result<(), NegotiationError> {
            let stream = self
                .stream
                .as_mut()
                .ok_or(NegotiationError::SignalingClosed)?;
            let text = message
                .to_json()
                .map_err(|e| NegotiationError::Relay(e.to_string()))?;
            stream
                .send(Message::Text(text))
                .await
                .map_err(|_| NegotiationError::SignalingClosed)
        }

        async fn recv(&mut self) -> Option<ServerMessage> {
            let stream = self.stream.as_mut()?;
            loop {
                match stream.next().await? {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                        Ok(message) => return Some(message),
                        Err(e) => warn!("Ignoring relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        }

        async fn close(&mut self) {
            if let Some(mut stream) = self.stream.take() {
                let _ = stream.close(None).await;
            }
        }
    }
}
