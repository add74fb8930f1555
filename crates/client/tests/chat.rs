mod common;

use std::sync::Arc;
use std::time::Duration;

use chasper_client::router::EventRouter;
use chasper_client::storage::MemoryStorage;
use chasper_client::stores::{ChannelStore, MessageStore};
use chasper_client::ChatService;
use chasper_shared::MessageStatus;
use common::{channel, message, received, settle, MockApi};

struct Harness {
    api: Arc<MockApi>,
    chat: Arc<ChatService>,
    messages: Arc<MessageStore>,
    channels: Arc<ChannelStore>,
}

fn harness() -> Harness {
    let api = MockApi::new();
    let storage = Arc::new(MemoryStorage::new());
    let messages = Arc::new(MessageStore::new(storage.clone(), "@chasper"));
    let channels = Arc::new(ChannelStore::new(storage, "@chasper"));
    let chat = Arc::new(ChatService::new(api.clone(), messages.clone(), channels.clone()));
    Harness {
        api,
        chat,
        messages,
        channels,
    }
}

#[tokio::test]
async fn confirmed_send_leaves_one_resolved_message() {
    let h = harness();

    let sent = h.chat.send_message("general", "u1", "  hello  ", None).await.unwrap();
    assert_eq!(sent.id, "srv-1");
    assert_eq!(sent.content, "hello");

    let stored = h.messages.get_messages("general").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, "srv-1");
    assert_eq!(stored[0].status, MessageStatus::Sent);
    assert!(stored[0].local_id.as_deref().unwrap().starts_with("local_"));
    assert_eq!(h.api.sent_requests()[0].content, "hello");
}

#[tokio::test(start_paused = true)]
async fn offline_send_goes_pending_then_failed_and_retry_creates_new_local_id() {
    let h = harness();
    h.api.set_offline(true);
    h.api.send_delay(Duration::from_secs(1));

    let send = tokio::spawn({
        let chat = h.chat.clone();
        async move { chat.send_message("general", "u1", "hello", None).await }
    });
    settle().await;

    let pending = h.messages.get_messages("general").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, MessageStatus::Pending);
    assert_eq!(pending[0].local_id.as_deref(), Some(pending[0].id.as_str()));

    assert!(send.await.unwrap().is_none());
    let failed = h.messages.get_messages("general").await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, MessageStatus::Failed);
    let failed_id = failed[0].id.clone();

    let retry = tokio::spawn({
        let chat = h.chat.clone();
        let failed_id = failed_id.clone();
        async move { chat.retry_failed("general", &failed_id).await }
    });
    settle().await;

    let during_retry = h.messages.get_messages("general").await;
    assert_eq!(during_retry.len(), 2);
    let fresh = during_retry.iter().find(|m| m.id != failed_id).unwrap();
    assert_eq!(fresh.status, MessageStatus::Pending);
    assert_eq!(fresh.content, "hello");
    assert_ne!(fresh.local_id, failed[0].local_id);

    assert!(retry.await.unwrap().is_none());
}

#[tokio::test]
async fn retry_ignores_messages_that_did_not_fail() {
    let h = harness();
    let sent = h.chat.send_message("general", "u1", "fine", None).await.unwrap();

    assert!(h.chat.retry_failed("general", &sent.id).await.is_none());
    assert!(h.chat.retry_failed("general", "missing").await.is_none());
    assert_eq!(h.api.sent_requests().len(), 1);
}

#[tokio::test]
async fn empty_and_oversized_content_is_refused() {
    let h = harness();
    assert!(h.chat.send_message("general", "u1", "   ", None).await.is_none());
    let long = "x".repeat(chasper_shared::MAX_MESSAGE_LENGTH + 1);
    assert!(h.chat.send_message("general", "u1", &long, None).await.is_none());

    assert!(h.messages.get_messages("general").await.is_empty());
    assert!(h.api.sent_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn socket_echo_before_http_response_folds_into_one_message() {
    let h = harness();
    h.api.send_delay(Duration::from_secs(1));
    let server_id = h.api.next_message_id();
    let router = EventRouter::new(h.messages.clone(), h.channels.clone());

    let send = tokio::spawn({
        let chat = h.chat.clone();
        async move { chat.send_message("general", "u1", "hi all", None).await }
    });
    settle().await;
    let local_id = h.messages.get_messages("general").await[0].local_id.clone();

    // The server broadcasts the new message before the HTTP call returns
    router
        .apply(received(message(&server_id, "general", 0, "hi all")))
        .await;
    assert_eq!(h.messages.get_messages("general").await.len(), 2);

    send.await.unwrap().unwrap();
    let stored = h.messages.get_messages("general").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, server_id);
    assert_eq!(stored[0].local_id, local_id);
    assert_eq!(stored[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn reply_is_carried_to_the_server() {
    let h = harness();
    let sent = h
        .chat
        .send_message("general", "u1", "agreed", Some("srv-0"))
        .await
        .unwrap();
    assert_eq!(sent.reply_to.as_deref(), Some("srv-0"));
    assert_eq!(h.api.sent_requests()[0].reply_to.as_deref(), Some("srv-0"));
}

#[tokio::test]
async fn edit_and_delete_apply_only_after_server_agrees() {
    let h = harness();
    let sent = h.chat.send_message("general", "u1", "typo", None).await.unwrap();

    assert!(h.chat.edit_message(&sent.id, "fixed").await);
    let stored = h.messages.get_messages("general").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "fixed");
    assert!(stored[0].edited_at.is_some());

    h.api.set_offline(true);
    assert!(!h.chat.edit_message(&sent.id, "again").await);
    assert!(!h.chat.delete_message(&sent.id).await);
    assert_eq!(h.messages.get_messages("general").await[0].content, "fixed");

    h.api.set_offline(false);
    assert!(h.chat.delete_message(&sent.id).await);
    assert!(h.messages.get_messages("general").await.is_empty());
}

#[tokio::test]
async fn history_page_merges_without_duplicates() {
    let h = harness();
    h.api.seed_messages(vec![
        message("srv-a", "general", 10, "older"),
        message("srv-b", "general", 20, "newer"),
    ]);
    h.messages.add_message(message("srv-b", "general", 20, "newer")).await;

    let page = h.chat.load_history("general", 1, None).await.unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(h.api.history_requests()[0].limit, Some(50));

    let ids: Vec<_> = h
        .messages
        .get_messages("general")
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, ["srv-a", "srv-b"]);

    h.api.set_offline(true);
    assert!(h.chat.load_history("general", 2, Some(10)).await.is_none());
}

#[tokio::test]
async fn channel_operations_keep_index_in_sync() {
    let h = harness();
    h.api.seed_channels(vec![channel("general", 1), channel("random", 5)]);

    let fetched = h.chat.fetch_channels().await;
    let ids: Vec<_> = fetched.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["random", "general"]);

    let created = h.chat.create_channel("Rust", Some("crabs")).await.unwrap();
    assert_eq!(h.channels.get_channels().await[0].id, created.id);

    assert!(h.chat.join_channel("music").await);
    assert!(h.channels.get_channel("music").await.is_some());

    assert!(h.chat.leave_channel("music").await);
    assert!(h.channels.get_channel("music").await.is_none());

    h.api.set_offline(true);
    assert!(h.chat.fetch_channels().await.is_empty());
    // The local index survives a failed fetch
    assert_eq!(h.channels.get_channels().await.len(), 3);
}

#[tokio::test]
async fn get_channel_falls_back_to_server_and_caches() {
    let h = harness();
    h.api.seed_channels(vec![channel("remote", 3)]);

    assert!(h.channels.get_channel("remote").await.is_none());
    let found = h.chat.get_channel("remote").await.unwrap();
    assert_eq!(found.id, "remote");

    h.api.set_offline(true);
    assert_eq!(h.chat.get_channel("remote").await.unwrap().id, "remote");
    assert!(h.chat.get_channel("nowhere").await.is_none());
}
