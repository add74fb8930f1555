//! Channel index, most recently updated first.

use std::sync::Arc;

use chasper_shared::{Channel, ChannelUpdate};
use tokio::sync::{broadcast, Mutex};

use super::reconcile::{upsert, Upsert};
use super::{StoreChange, CHANGE_CHANNEL_CAPACITY};
use crate::storage::{self, KeyValueStorage};

pub struct ChannelStore {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    cache: Mutex<Index>,
    changes: broadcast::Sender<StoreChange>,
}

#[derive(Default)]
struct Index {
    /// `None` until the index has been read from storage.
    channels: Option<Vec<Channel>>,
    /// The stored index could not be read; do not write over it.
    unreadable: bool,
}

impl ChannelStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, namespace: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            storage,
            key: format!("{}/channels", namespace.into()),
            cache: Mutex::new(Index::default()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn storage_key(&self) -> &str {
        &self.key
    }

    /// The channel index. Missing stored data yields an empty list.
    pub async fn get_channels(&self) -> Vec<Channel> {
        let mut cache = self.cache.lock().await;
        if let Some(channels) = cache.channels.as_ref() {
            return channels.clone();
        }

        match storage::load::<Vec<Channel>>(self.storage.as_ref(), &self.key).await {
            Ok(stored) => {
                let channels = stored.unwrap_or_default();
                cache.channels = Some(channels.clone());
                channels
            }
            Err(e) => {
                crate::log_error!("Failed to get channels: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn get_channel(&self, channel_id: &str) -> Option<Channel> {
        self.get_channels().await.into_iter().find(|c| c.id == channel_id)
    }

    /// Replace the whole index, e.g. after fetching it from the server.
    pub async fn set_channels(&self, mut channels: Vec<Channel>) {
        sort_by_recency(&mut channels);
        let mut cache = self.cache.lock().await;
        cache.unreadable = false;
        self.persist(&channels, true).await;
        cache.channels = Some(channels);
        drop(cache);

        let _ = self.changes.send(StoreChange::ChannelsChanged);
    }

    /// Replace the channel with the same id, or append it.
    pub async fn add_channel(&self, channel: Channel) -> Upsert {
        let mut cache = self.cache.lock().await;
        let (channels, durable) = self.warm(&mut cache).await;
        let outcome = upsert(channels, channel);
        sort_by_recency(channels);
        self.persist(channels, durable).await;
        drop(cache);

        let _ = self.changes.send(StoreChange::ChannelsChanged);
        outcome
    }

    /// Apply a partial update to a stored channel. Unknown ids are ignored.
    pub async fn update_channel(&self, channel_id: &str, update: ChannelUpdate) -> Option<Channel> {
        let mut cache = self.cache.lock().await;
        let (channels, durable) = self.warm(&mut cache).await;
        let channel = channels.iter_mut().find(|c| c.id == channel_id)?;
        channel.apply(update);
        let updated = channel.clone();
        sort_by_recency(channels);
        self.persist(channels, durable).await;
        drop(cache);

        let _ = self.changes.send(StoreChange::ChannelsChanged);
        Some(updated)
    }

    pub async fn clear_cache(&self) {
        *self.cache.lock().await = Index::default();
    }

    /// The cached index, loading it first if needed, and whether it may be
    /// written back.
    async fn warm<'c>(&self, cache: &'c mut Index) -> (&'c mut Vec<Channel>, bool) {
        if cache.channels.is_none() {
            let channels = match storage::load::<Vec<Channel>>(self.storage.as_ref(), &self.key).await {
                Ok(stored) => stored.unwrap_or_default(),
                Err(e) => {
                    crate::log_error!("Failed to get channels: {}", e);
                    cache.unreadable = true;
                    Vec::new()
                }
            };
            cache.channels = Some(channels);
        }
        let durable = !cache.unreadable;
        (cache.channels.get_or_insert_with(Vec::new), durable)
    }

    async fn persist(&self, channels: &[Channel], durable: bool) {
        if !durable {
            crate::log_warn!("Keeping channels in memory: stored index was unreadable");
            return;
        }
        if let Err(e) = storage::save(self.storage.as_ref(), &self.key, channels).await {
            crate::log_error!("Failed to persist channels: {}", e);
        }
    }
}

/// Most recently updated first. Stable for equal `updated_at`.
fn sort_by_recency(channels: &mut [Channel]) {
    channels.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}
