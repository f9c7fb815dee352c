//! Transport abstraction over the duplex frame channel.
//!
//! The Connection Manager owns exactly one boxed [`Transport`] at a time
//! and never touches tungstenite types directly — integration tests swap
//! in an in-memory channel transport through the same [`Connector`] seam.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::error::SyncError;

/// Close code the relay uses to demand a session-key rotation.
pub const CLOSE_SESSION_ROTATION: u16 = 1001;

/// What the Connection Manager sees from the wire.
#[derive(Debug)]
pub enum TransportEvent {
    /// One text frame of JSON.
    Frame(String),
    /// The transport reached closed state; `code` carries the close code
    /// when the peer sent one.
    Closed { code: Option<u16> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&mut self, text: String) -> Result<(), SyncError>;
    /// Resolves with the next frame, or `Closed` exactly once at the end
    /// of the connection (errors collapse into `Closed`).
    async fn recv(&mut self) -> TransportEvent;
    /// Keepalive probe.
    async fn ping(&mut self) -> Result<(), SyncError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, SyncError>;
}

// ── WebSocket implementation ─────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WsTransport {
    stream: WsStream,
    closed: bool,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), SyncError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> TransportEvent {
        if self.closed {
            return TransportEvent::Closed { code: None };
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Frame(text.as_str().to_owned())
                }
                Some(Ok(Message::Close(frame))) => {
                    self.closed = true;
                    let code = frame.map(|f| u16::from(f.code));
                    debug!(?code, "transport closed by peer");
                    return TransportEvent::Closed { code };
                }
                Some(Ok(Message::Ping(payload))) => {
                    // tungstenite queues the pong; a flush pushes it out.
                    let _ = self.stream.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed)) | None => {
                    self.closed = true;
                    return TransportEvent::Closed { code: None };
                }
                Some(Err(e)) => {
                    warn!(error = %e, "transport receive error");
                    self.closed = true;
                    return TransportEvent::Closed { code: None };
                }
            }
        }
    }

    async fn ping(&mut self) -> Result<(), SyncError> {
        self.stream
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
        self.closed = true;
    }
}

/// Production connector.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, SyncError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Box::new(WsTransport { stream, closed: false }))
    }
}
