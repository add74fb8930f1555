//! Chasper Client - realtime messaging layer
//!
//! Keeps a live event connection to the chat server, an offline-capable
//! cache of channels and messages, and reconciles optimistic sends with the
//! server's confirmed records.

pub mod api_client;
pub mod chat;
pub mod config;
pub mod logging;
pub mod router;
pub mod storage;
pub mod stores;
pub mod ws;

pub use api_client::{ApiClient, RemoteApi};
pub use chat::ChatService;
pub use config::ClientConfig;
pub use router::{EventRouter, RouterHandle};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use stores::{ChannelStore, MessageStore, StoreChange};
pub use ws::{ConnectionManager, ConnectionState, ReconnectConfig, TungsteniteTransport};
