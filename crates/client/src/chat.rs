//! Application-facing chat operations: optimistic sends, edits, history and
//! channel membership, each combining a remote call with the stores.

use std::sync::Arc;

use chasper_shared::{
    Channel, CreateChannelRequest, GetMessagesRequest, Message, MessageStatus, PaginatedResponse,
    SendMessageRequest, MAX_MESSAGE_LENGTH,
};

use crate::api_client::RemoteApi;
use crate::stores::{ChannelStore, MessageStore};

/// Default page size for [`ChatService::load_history`].
pub const DEFAULT_PAGE_SIZE: u32 = 50;

pub struct ChatService {
    api: Arc<dyn RemoteApi>,
    messages: Arc<MessageStore>,
    channels: Arc<ChannelStore>,
}

/// Trimmed message body, or `None` when it is empty or too long.
pub fn normalize_content(content: &str) -> Option<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_MESSAGE_LENGTH {
        return None;
    }
    Some(trimmed)
}

impl ChatService {
    pub fn new(api: Arc<dyn RemoteApi>, messages: Arc<MessageStore>, channels: Arc<ChannelStore>) -> Self {
        Self {
            api,
            messages,
            channels,
        }
    }

    pub fn messages(&self) -> &Arc<MessageStore> {
        &self.messages
    }

    pub fn channels(&self) -> &Arc<ChannelStore> {
        &self.channels
    }

    /// Send a message optimistically.
    ///
    /// The pending message is stored before the remote call. On success the
    /// optimistic entry is resolved to the server record and returned; on
    /// failure it is marked [`MessageStatus::Failed`] and `None` is returned.
    /// Empty or over-long content is refused without touching the store.
    pub async fn send_message(
        &self,
        channel_id: &str,
        author_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Option<Message> {
        let Some(content) = normalize_content(content) else {
            crate::log_warn!(
                "Refusing to send empty or over-long message ({} chars max)",
                MAX_MESSAGE_LENGTH
            );
            return None;
        };

        let mut optimistic = self.messages.create_optimistic_message(content, channel_id, author_id);
        optimistic.reply_to = reply_to.map(str::to_string);
        let local_id = optimistic.local_id.clone();
        self.messages.add_message(optimistic.clone()).await;

        let request = SendMessageRequest {
            content: content.to_string(),
            channel_id: channel_id.to_string(),
            reply_to: optimistic.reply_to.clone(),
        };

        match self.api.send_message(&request).await {
            Some(mut confirmed) => {
                self.messages
                    .update_message_status(&confirmed.id, local_id.as_deref(), MessageStatus::Sent)
                    .await;

                confirmed.status = MessageStatus::Sent;
                if confirmed.local_id.is_none() {
                    confirmed.local_id = local_id;
                }
                self.messages.add_message(confirmed.clone()).await;
                Some(confirmed)
            }
            None => {
                self.messages
                    .update_message_status(&optimistic.id, local_id.as_deref(), MessageStatus::Failed)
                    .await;
                None
            }
        }
    }

    /// Send a failed message's content again as a new optimistic message.
    /// Only messages currently marked failed are retried.
    pub async fn retry_failed(&self, channel_id: &str, message_id: &str) -> Option<Message> {
        let failed = self
            .messages
            .get_messages(channel_id)
            .await
            .into_iter()
            .find(|m| m.id == message_id && m.status == MessageStatus::Failed)?;

        crate::log_info!("Retrying failed message {}", failed.id);
        self.send_message(
            channel_id,
            &failed.author_id,
            &failed.content,
            failed.reply_to.as_deref(),
        )
        .await
    }

    /// Edit a confirmed message. The store changes only after the server agrees.
    pub async fn edit_message(&self, message_id: &str, content: &str) -> bool {
        let Some(content) = normalize_content(content) else {
            return false;
        };
        match self.api.update_message(message_id, content).await {
            Some(updated) => {
                self.messages.add_message(updated).await;
                true
            }
            None => false,
        }
    }

    /// Delete a message remotely, then locally.
    pub async fn delete_message(&self, message_id: &str) -> bool {
        if !self.api.delete_message(message_id).await {
            return false;
        }
        self.messages.delete_message(message_id).await;
        true
    }

    /// Fetch one page of history and merge it into the channel.
    pub async fn load_history(
        &self,
        channel_id: &str,
        page: u32,
        limit: Option<u32>,
    ) -> Option<PaginatedResponse<Message>> {
        let request = GetMessagesRequest {
            channel_id: channel_id.to_string(),
            page: Some(page),
            limit: Some(limit.unwrap_or(DEFAULT_PAGE_SIZE)),
            before: None,
        };
        let history = self.api.get_messages(&request).await?;
        self.messages.set_history(channel_id, history.items.clone()).await;
        Some(history)
    }

    /// Replace the channel index with the server's list. Empty on failure.
    pub async fn fetch_channels(&self) -> Vec<Channel> {
        let Some(channels) = self.api.get_channels().await else {
            return Vec::new();
        };
        self.channels.set_channels(channels).await;
        self.channels.get_channels().await
    }

    pub async fn create_channel(&self, name: &str, description: Option<&str>) -> Option<Channel> {
        let request = CreateChannelRequest {
            name: name.to_string(),
            description: description.map(str::to_string),
        };
        let channel = self.api.create_channel(&request).await?;
        self.channels.add_channel(channel.clone()).await;
        Some(channel)
    }

    pub async fn join_channel(&self, channel_id: &str) -> bool {
        if !self.api.join_channel(channel_id).await {
            return false;
        }
        self.fetch_channels().await;
        true
    }

    pub async fn leave_channel(&self, channel_id: &str) -> bool {
        if !self.api.leave_channel(channel_id).await {
            return false;
        }
        self.fetch_channels().await;
        true
    }

    /// A channel from the local index, falling back to the server (and
    /// caching the result) when it is not known locally.
    pub async fn get_channel(&self, channel_id: &str) -> Option<Channel> {
        if let Some(channel) = self.channels.get_channel(channel_id).await {
            return Some(channel);
        }
        let channel = self.api.get_channel(channel_id).await?;
        self.channels.add_channel(channel.clone()).await;
        Some(channel)
    }
}
