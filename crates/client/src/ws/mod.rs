//! Realtime connection to the chat server.
//!
//! This module provides:
//! - [`ConnectionManager`]: connect, heartbeat, reconnect with backoff, and
//!   fan-out of inbound events to registered handlers
//! - [`Transport`]: the socket seam, with a tokio-tungstenite implementation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  text frames   ┌───────────────────┐
//! │    Transport     │ ─────────────► │ ConnectionManager │
//! │ (WebSocket)      │ ◄───────────── │ (state, timers)   │
//! └──────────────────┘  ping / send   └───────────────────┘
//!                                              │ Event
//!                                              ▼
//!                                     ┌───────────────────┐
//!                                     │    EventRouter    │
//!                                     └───────────────────┘
//!                                              │
//!                                              ▼
//!                                     ┌───────────────────┐
//!                                     │  MessageStore /   │
//!                                     │  ChannelStore     │
//!                                     └───────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::from_config(&config, Arc::new(TungsteniteTransport));
//! let router = EventRouter::spawn(messages, channels);
//! manager.add_event_handler(move |event| router.route(event));
//! manager.connect(Some(&token)).await?;
//! ```

mod connection;
mod transport;

pub use connection::{
    ConnectionError, ConnectionManager, ConnectionState, EventHandler, ReconnectConfig,
    StateHandler, Subscription,
};
pub use transport::{SocketFrame, SocketPair, Transport, TransportError, TungsteniteTransport};
