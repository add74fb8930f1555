//! Per-channel message lists with optimistic-send reconciliation.
//!
//! Messages are kept per `channel_id`, sorted by timestamp ascending. The sort
//! is stable: records with equal timestamps keep their previous relative
//! order, and newly appended records go after existing ones.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chasper_shared::{Message, MessageStatus};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use super::reconcile::{matching_positions, upsert, Reconcile, ReconciliationKey, Upsert};
use super::{StoreChange, CHANGE_CHANNEL_CAPACITY};
use crate::storage::{self, KeyValueStorage};

#[derive(Default)]
struct Cache {
    channels: BTreeMap<String, Vec<Message>>,
    /// Channels whose stored list could not be read. Their durable copy is
    /// left alone until a later load succeeds.
    unreadable: HashSet<String>,
}

impl Cache {
    fn durable(&self, channel_id: &str) -> bool {
        !self.unreadable.contains(channel_id)
    }
}

pub struct MessageStore {
    storage: Arc<dyn KeyValueStorage>,
    namespace: String,
    cache: Mutex<Cache>,
    changes: broadcast::Sender<StoreChange>,
}

impl MessageStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, namespace: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            storage,
            namespace: namespace.into(),
            cache: Mutex::new(Cache::default()),
            changes,
        }
    }

    /// Receive a [`StoreChange`] after every successful mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Durable key for a channel's message list.
    pub fn storage_key(&self, channel_id: &str) -> String {
        format!("{}/messages_{}", self.namespace, channel_id)
    }

    /// Build a pending message with a fresh local id. Nothing is stored.
    pub fn create_optimistic_message(&self, content: &str, channel_id: &str, author_id: &str) -> Message {
        let now = Utc::now();
        let local_id = format!(
            "local_{}_{}",
            now.timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        );

        Message {
            id: local_id.clone(),
            local_id: Some(local_id),
            content: content.to_string(),
            author_id: author_id.to_string(),
            channel_id: channel_id.to_string(),
            timestamp: now,
            status: MessageStatus::Pending,
            reply_to: None,
            edited_at: None,
        }
    }

    /// Messages of a channel in display order. Loads from storage on first use.
    pub async fn get_messages(&self, channel_id: &str) -> Vec<Message> {
        let mut cache = self.cache.lock().await;
        if let Some(messages) = cache.channels.get(channel_id) {
            return messages.clone();
        }

        match self.load(channel_id).await {
            Ok(messages) => {
                cache.channels.insert(channel_id.to_string(), messages.clone());
                messages
            }
            Err(e) => {
                crate::log_error!("Failed to get messages for {}: {}", channel_id, e);
                Vec::new()
            }
        }
    }

    /// Merge a message into its channel: replace the record with the same id
    /// (or the same local id) in place, otherwise append; then re-sort.
    pub async fn add_message(&self, message: Message) -> Upsert {
        let channel_id = message.channel_id.clone();
        let message_id = message.id.clone();

        let mut cache = self.cache.lock().await;
        let (messages, durable) = self.warm(&mut cache, &channel_id).await;
        let outcome = upsert(messages, message);
        sort_by_timestamp(messages);
        self.persist(&channel_id, messages, durable).await;
        drop(cache);

        let change = match outcome {
            Upsert::Inserted => StoreChange::MessageAdded { channel_id, message_id },
            Upsert::Replaced => StoreChange::MessageUpdated { channel_id, message_id },
        };
        let _ = self.changes.send(change);
        outcome
    }

    /// Merge a page of server history into a channel.
    pub async fn set_history(&self, channel_id: &str, history: Vec<Message>) {
        let mut cache = self.cache.lock().await;
        let (messages, durable) = self.warm(&mut cache, channel_id).await;
        for message in history {
            upsert(messages, message);
        }
        sort_by_timestamp(messages);
        self.persist(channel_id, messages, durable).await;
        drop(cache);

        let _ = self.changes.send(StoreChange::HistoryMerged {
            channel_id: channel_id.to_string(),
        });
    }

    /// Set the status of the message matching `id` or `local_id` in any cached
    /// channel. When `id` differs from the stored id (an optimistic message
    /// being confirmed) the stored id becomes `id`; the local id is kept.
    ///
    /// Returns the updated message, or `None` if nothing matched.
    pub async fn update_message_status(
        &self,
        id: &str,
        local_id: Option<&str>,
        status: MessageStatus,
    ) -> Option<Message> {
        let key = ReconciliationKey::new(Some(id), local_id);

        let mut cache = self.cache.lock().await;
        let (channel_id, matches) = cache.channels.iter().find_map(|(channel_id, messages)| {
            let matches = matching_positions(messages, &key);
            (!matches.is_empty()).then(|| (channel_id.clone(), matches))
        })?;
        let durable = cache.durable(&channel_id);
        let messages = cache.channels.get_mut(&channel_id)?;
        let (&first, rest) = matches.split_first()?;

        // A copy already carrying the server id came over the socket; prefer
        // its content and fold the optimistic record into it.
        let source = matches.iter().copied().find(|&i| messages[i].id == id).unwrap_or(first);
        let mut resolved = messages[source].clone();
        for &index in &matches {
            resolved.inherit(&messages[index]);
        }
        resolved.id = id.to_string();
        resolved.status = status;

        messages[first] = resolved.clone();
        for &index in rest.iter().rev() {
            messages.remove(index);
        }
        sort_by_timestamp(messages);
        self.persist(&channel_id, messages, durable).await;
        drop(cache);

        let _ = self.changes.send(StoreChange::MessageUpdated {
            channel_id,
            message_id: resolved.id.clone(),
        });
        Some(resolved)
    }

    /// Remove the message with server id `id` from the first cached channel
    /// holding it. Returns the removed message.
    pub async fn delete_message(&self, id: &str) -> Option<Message> {
        let mut cache = self.cache.lock().await;
        let (channel_id, index) = cache.channels.iter().find_map(|(channel_id, messages)| {
            messages
                .iter()
                .position(|m| m.id == id)
                .map(|i| (channel_id.clone(), i))
        })?;

        let durable = cache.durable(&channel_id);
        let messages = cache.channels.get_mut(&channel_id)?;
        let removed = messages.remove(index);
        self.persist(&channel_id, messages, durable).await;
        drop(cache);

        let _ = self.changes.send(StoreChange::MessageDeleted {
            channel_id,
            message_id: removed.id.clone(),
        });
        Some(removed)
    }

    /// All cached messages still waiting for server confirmation.
    pub async fn get_pending_messages(&self) -> Vec<Message> {
        let cache = self.cache.lock().await;
        cache
            .channels
            .values()
            .flatten()
            .filter(|m| m.status == MessageStatus::Pending)
            .cloned()
            .collect()
    }

    /// Drop the in-memory cache. The next read reloads from storage.
    pub async fn clear_cache(&self) {
        *self.cache.lock().await = Cache::default();
    }

    async fn load(&self, channel_id: &str) -> Result<Vec<Message>, storage::StorageError> {
        let stored = storage::load(self.storage.as_ref(), &self.storage_key(channel_id)).await?;
        Ok(stored.unwrap_or_default())
    }

    /// Cached list for a channel, loading it first if needed, and whether it
    /// may be written back. A failed load starts the channel empty and
    /// in-memory only.
    async fn warm<'c>(&self, cache: &'c mut Cache, channel_id: &str) -> (&'c mut Vec<Message>, bool) {
        if !cache.channels.contains_key(channel_id) {
            let messages = match self.load(channel_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    crate::log_error!("Failed to get messages for {}: {}", channel_id, e);
                    cache.unreadable.insert(channel_id.to_string());
                    Vec::new()
                }
            };
            cache.channels.insert(channel_id.to_string(), messages);
        }
        let durable = cache.durable(channel_id);
        (cache.channels.entry(channel_id.to_string()).or_default(), durable)
    }

    async fn persist(&self, channel_id: &str, messages: &[Message], durable: bool) {
        if !durable {
            crate::log_warn!("Keeping messages for {} in memory: stored copy was unreadable", channel_id);
            return;
        }
        if let Err(e) = storage::save(self.storage.as_ref(), &self.storage_key(channel_id), messages).await {
            crate::log_error!("Failed to persist messages for {}: {}", channel_id, e);
        }
    }
}

fn sort_by_timestamp(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
}
