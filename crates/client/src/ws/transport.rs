//! Duplex text socket underneath the connection manager.
//!
//! A [`Transport`] opens one socket per call and hands back a [`SocketPair`]:
//! an outbound sender for text frames and an inbound stream of
//! [`SocketFrame`]s. Dropping the outbound sender closes the socket. The
//! inbound stream always ends with [`SocketFrame::Closed`] when the peer or the
//! network ends the connection.

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to open socket: {0}")]
    Connect(String),
    #[error("socket closed before it opened: {0}")]
    Closed(String),
}

/// One inbound item from an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    /// Terminal. Nothing follows.
    Closed { reason: String },
}

/// Both halves of an open socket.
pub struct SocketPair {
    pub outbound: UnboundedSender<String>,
    pub inbound: UnboundedReceiver<SocketFrame>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a socket to `address`. Resolves once the socket is open.
    async fn open(&self, address: &str) -> Result<SocketPair, TransportError>;
}

/// Classify a failed handshake. A socket that closed mid-handshake is
/// reported as [`TransportError::Closed`].
fn open_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed(e.to_string()),
        WsError::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            TransportError::Closed(e.to_string())
        }
        other => TransportError::Connect(other.to_string()),
    }
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, address: &str) -> Result<SocketPair, TransportError> {
        let (ws_stream, _response) = connect_async(address).await.map_err(open_error)?;

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = unbounded::<String>();
        let (inbound_tx, inbound) = unbounded::<SocketFrame>();

        // Write task: runs until the manager drops its sender
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.next().await {
                crate::log_debug!("WebSocket sending: {}", text);
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    crate::log_error!("Send failed: {}", e);
                    break;
                }
            }
            if let Err(e) = write.close().await {
                crate::log_debug!("WebSocket close failed: {}", e);
            }
        });

        // Read task
        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let frame = SocketFrame::Text(text.as_str().to_owned());
                        if inbound_tx.unbounded_send(frame).is_err() {
                            // Receiver gone, nobody is listening any more
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("close frame {}: {}", u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| "close frame".to_string());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        // Pong is handled automatically by tungstenite
                        crate::log_debug!("Received ping: {:?}", data);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = inbound_tx.unbounded_send(SocketFrame::Closed { reason });
        });

        Ok(SocketPair { outbound, inbound })
    }
}
