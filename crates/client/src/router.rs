//! Event router: applies inbound realtime events to the stores.
//!
//! The connection manager delivers events from a synchronous callback, while
//! the stores are async. [`EventRouter::spawn`] bridges the two with a
//! single-consumer queue: the callback only enqueues and one worker applies
//! events in arrival order.

use std::sync::Arc;

use chasper_shared::{Event, EventKind, Message, MessageStatus};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::stores::{ChannelStore, MessageStore};

/// Dispatches each [`Event`] by kind to the store operation it implies.
#[derive(Clone)]
pub struct EventRouter {
    messages: Arc<MessageStore>,
    channels: Arc<ChannelStore>,
}

enum Job {
    Apply(Event),
    Flush(oneshot::Sender<()>),
}

/// Enqueueing side of a spawned router. Cheap to clone.
#[derive(Clone)]
pub struct RouterHandle {
    queue: mpsc::UnboundedSender<Job>,
}

impl RouterHandle {
    /// Queue an event for the worker. Fails only once the worker has stopped.
    pub fn route(&self, event: &Event) -> anyhow::Result<()> {
        self.queue
            .send(Job::Apply(event.clone()))
            .map_err(|_| anyhow::anyhow!("event router stopped, dropping {}", event.type_name()))
    }

    /// Wait until every event queued before this call has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(Job::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl EventRouter {
    pub fn new(messages: Arc<MessageStore>, channels: Arc<ChannelStore>) -> Self {
        Self { messages, channels }
    }

    /// Start the worker. It runs until every [`RouterHandle`] is dropped.
    pub fn spawn(self) -> (RouterHandle, JoinHandle<()>) {
        let (queue, mut jobs) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                match job {
                    Job::Apply(event) => self.apply(event).await,
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            crate::log_debug!("Event router stopped");
        });
        (RouterHandle { queue }, worker)
    }

    /// Apply one event.
    pub async fn apply(&self, event: Event) {
        match event.channel_id() {
            Some(channel_id) => crate::log_debug!("Routing {} event for {}", event.type_name(), channel_id),
            None => crate::log_debug!("Routing {} event", event.type_name()),
        }
        match event.kind {
            EventKind::MessageSent(payload)
            | EventKind::MessageReceived(payload)
            | EventKind::MessageUpdated(payload) => {
                self.store_confirmed(payload.message).await;
            }
            EventKind::MessageDeleted(payload) => {
                if self.messages.delete_message(&payload.message_id).await.is_none() {
                    crate::log_debug!(
                        "Delete for unknown message {} in {}",
                        payload.message_id,
                        payload.channel_id
                    );
                }
            }
            EventKind::ChannelCreated(payload) | EventKind::ChannelUpdated(payload) => {
                self.channels.add_channel(payload.channel).await;
            }
            EventKind::UserTyping(payload) => {
                crate::log_debug!(
                    "Typing event: {} in {} ({})",
                    payload.user_id,
                    payload.channel_id,
                    payload.is_typing
                );
            }
            EventKind::UserOnline(payload) => {
                crate::log_debug!("User status event: {} online", payload.user.id);
            }
            EventKind::UserOffline(payload) => {
                crate::log_debug!("User status event: {} offline", payload.user.id);
            }
        }
    }

    /// Anything the server pushes has been accepted by it.
    async fn store_confirmed(&self, mut message: Message) {
        message.status = MessageStatus::Sent;
        self.messages.add_message(message).await;
    }
}

#[cfg(test)]
mod tests {
    use chasper_shared::{MessageDeletedPayload, MessagePayload};
    use chrono::Utc;

    use super::*;
    use crate::storage::MemoryStorage;

    fn router() -> EventRouter {
        let storage = Arc::new(MemoryStorage::new());
        EventRouter::new(
            Arc::new(MessageStore::new(storage.clone(), "@chasper")),
            Arc::new(ChannelStore::new(storage, "@chasper")),
        )
    }

    fn inbound(id: &str, content: &str) -> Event {
        Event::new(EventKind::MessageReceived(MessagePayload {
            message: Message {
                id: id.into(),
                local_id: None,
                content: content.into(),
                author_id: "u2".into(),
                channel_id: "general".into(),
                timestamp: Utc::now(),
                status: MessageStatus::Delivered,
                reply_to: None,
                edited_at: None,
            },
        }))
    }

    #[tokio::test]
    async fn repeated_delivery_keeps_one_copy_with_latest_payload() {
        let router = router();
        router.apply(inbound("srv-1", "first")).await;
        router.apply(inbound("srv-1", "second")).await;

        let stored = router.messages.get_messages("general").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "second");
        assert_eq!(stored[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn delete_event_removes_message() {
        let router = router();
        router.apply(inbound("srv-1", "bye")).await;
        router
            .apply(Event::new(EventKind::MessageDeleted(MessageDeletedPayload {
                message_id: "srv-1".into(),
                channel_id: "general".into(),
            })))
            .await;
        assert!(router.messages.get_messages("general").await.is_empty());
    }

    #[tokio::test]
    async fn queued_events_apply_in_arrival_order() {
        let router = router();
        let messages = router.messages.clone();
        let (handle, worker) = router.spawn();

        handle.route(&inbound("srv-1", "a")).unwrap();
        handle.route(&inbound("srv-1", "b")).unwrap();
        handle.route(&inbound("srv-2", "c")).unwrap();
        handle.flush().await;

        let contents: Vec<_> = messages
            .get_messages("general")
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["b", "c"]);

        drop(handle);
        worker.await.unwrap();
    }
}
