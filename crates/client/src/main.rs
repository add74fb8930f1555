//! Chasper Client - headless entry point
//!
//! Connects to the chat server, keeps the local stores in sync with the
//! realtime feed, and logs store changes until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use chasper_client::{
    logging, ApiClient, ChannelStore, ChatService, ClientConfig, ConnectionManager, EventRouter,
    FileStorage, KeyValueStorage, MessageStore, TungsteniteTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::DEFAULT_FILTER);

    let config = ClientConfig::from_env();
    let token = std::env::var("CHASPER_TOKEN").ok();

    let storage: Arc<dyn KeyValueStorage> = match &config.data_dir {
        Some(dir) => Arc::new(FileStorage::new(dir)),
        None => Arc::new(FileStorage::in_config_dir().context("no storage directory available")?),
    };
    let messages = Arc::new(MessageStore::new(storage.clone(), config.storage_namespace.clone()));
    let channels = Arc::new(ChannelStore::new(storage, config.storage_namespace.clone()));

    let api = ApiClient::new()
        .with_base_url(config.api_url.clone())
        .with_token(token.clone());
    let chat = ChatService::new(Arc::new(api), messages.clone(), channels.clone());

    let (router, worker) = EventRouter::new(messages.clone(), channels.clone()).spawn();
    let manager = ConnectionManager::from_config(&config, Arc::new(TungsteniteTransport));
    let events = manager.add_event_handler(move |event| router.route(event));
    let states = manager.add_connection_state_handler(|connected| {
        chasper_client::log_info!("Connection state: {}", if connected { "online" } else { "offline" });
    });

    let known = chat.fetch_channels().await;
    chasper_client::log_info!("{} channels available", known.len());

    if let Err(e) = manager.connect(token.as_deref()).await {
        // Keep serving the offline cache; the caller decides when to retry
        chasper_client::log_error!("Initial connect failed: {}", e);
    }

    let mut message_changes = messages.subscribe();
    let mut channel_changes = channels.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(change) = message_changes.recv() => {
                chasper_client::log_info!("Store change: {:?}", change);
            }
            Ok(change) = channel_changes.recv() => {
                chasper_client::log_info!("Store change: {:?}", change);
            }
        }
    }

    chasper_client::log_info!("Shutting down");
    manager.disconnect();
    events.unsubscribe();
    states.unsubscribe();
    worker.await.context("event router worker failed")?;
    Ok(())
}
