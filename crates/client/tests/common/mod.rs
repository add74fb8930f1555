//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chasper_client::api_client::RemoteApi;
use chasper_client::ws::{SocketFrame, SocketPair, Transport, TransportError};
use chasper_shared::{
    Channel, CreateChannelRequest, Event, EventKind, GetMessagesRequest, Message, MessagePayload,
    MessageStatus, PaginatedResponse, SendMessageRequest,
};
use chrono::{DateTime, TimeZone, Utc};
use futures_channel::mpsc::unbounded;
use futures_util::StreamExt;
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Let spawned tasks run without advancing the (paused) clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

pub fn message(id: &str, channel_id: &str, secs: i64, content: &str) -> Message {
    Message {
        id: id.into(),
        local_id: None,
        content: content.into(),
        author_id: "u2".into(),
        channel_id: channel_id.into(),
        timestamp: at(secs),
        status: MessageStatus::Sent,
        reply_to: None,
        edited_at: None,
    }
}

pub fn channel(id: &str, updated: i64) -> Channel {
    Channel {
        id: id.into(),
        name: format!("#{id}"),
        description: None,
        is_private: false,
        member_ids: vec!["u1".into()],
        last_message: None,
        unread_count: 0,
        created_at: at(0),
        updated_at: at(updated),
    }
}

pub fn received(message: Message) -> Event {
    Event::new(EventKind::MessageReceived(MessagePayload { message }))
}

// =========================================
// Transport double
// =========================================

/// Server end of one accepted mock socket.
#[derive(Clone)]
pub struct ServerSocket {
    frames: futures_channel::mpsc::UnboundedSender<SocketFrame>,
    sent: Arc<Mutex<Vec<String>>>,
    client_closed: Arc<AtomicBool>,
}

impl ServerSocket {
    pub fn push_text(&self, text: &str) {
        let _ = self.frames.unbounded_send(SocketFrame::Text(text.to_string()));
    }

    pub fn push_event(&self, event: &Event) {
        self.push_text(&serde_json::to_string(event).unwrap());
    }

    /// Close from the server side.
    pub fn close(&self, reason: &str) {
        let _ = self.frames.unbounded_send(SocketFrame::Closed {
            reason: reason.to_string(),
        });
    }

    /// Frames the client has sent so far.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn client_closed(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub address: String,
    pub at: Instant,
}

#[derive(Default)]
struct TransportState {
    opens: Vec<OpenRecord>,
    refuse_next: VecDeque<bool>,
    refuse_all: bool,
    open_delay: Option<Duration>,
    sockets: Vec<ServerSocket>,
}

/// Scriptable transport that records every open with its virtual time.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<TransportState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse_all(&self, refuse: bool) {
        lock(&self.state).refuse_all = refuse;
    }

    pub fn refuse_next(&self) {
        lock(&self.state).refuse_next.push_back(true);
    }

    /// Make every open take `delay` before resolving.
    pub fn open_delay(&self, delay: Duration) {
        lock(&self.state).open_delay = Some(delay);
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        lock(&self.state).opens.clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens.len()
    }

    /// Most recently accepted socket.
    pub fn socket(&self) -> ServerSocket {
        lock(&self.state).sockets.last().cloned().expect("no socket accepted yet")
    }

    pub fn sockets(&self) -> Vec<ServerSocket> {
        lock(&self.state).sockets.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, address: &str) -> Result<SocketPair, TransportError> {
        let (delay, refuse) = {
            let mut state = lock(&self.state);
            state.opens.push(OpenRecord {
                address: address.to_string(),
                at: Instant::now(),
            });
            let refuse = state.refuse_next.pop_front().unwrap_or(state.refuse_all);
            (state.open_delay, refuse)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if refuse {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (outbound, mut outbound_rx) = unbounded::<String>();
        let (frames, inbound) = unbounded::<SocketFrame>();
        let server = ServerSocket {
            frames,
            sent: Arc::new(Mutex::new(Vec::new())),
            client_closed: Arc::new(AtomicBool::new(false)),
        };

        let sent = server.sent.clone();
        let client_closed = server.client_closed.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.next().await {
                lock(&sent).push(text);
            }
            client_closed.store(true, Ordering::SeqCst);
        });

        lock(&self.state).sockets.push(server);
        Ok(SocketPair { outbound, inbound })
    }
}

// =========================================
// Remote API double
// =========================================

#[derive(Default)]
struct ApiState {
    offline: bool,
    send_delay: Option<Duration>,
    next_id: u32,
    messages: Vec<Message>,
    channels: Vec<Channel>,
    sent_requests: Vec<SendMessageRequest>,
    history_requests: Vec<GetMessagesRequest>,
}

/// In-memory server. While offline every call fails.
#[derive(Default)]
pub struct MockApi {
    state: Mutex<ApiState>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        lock(&self.state).offline = offline;
    }

    /// Delay `send_message` responses, to observe the pending window.
    pub fn send_delay(&self, delay: Duration) {
        lock(&self.state).send_delay = Some(delay);
    }

    /// Id the next accepted message will get.
    pub fn next_message_id(&self) -> String {
        format!("srv-{}", lock(&self.state).next_id + 1)
    }

    pub fn seed_messages(&self, messages: Vec<Message>) {
        lock(&self.state).messages.extend(messages);
    }

    pub fn seed_channels(&self, channels: Vec<Channel>) {
        lock(&self.state).channels.extend(channels);
    }

    pub fn sent_requests(&self) -> Vec<SendMessageRequest> {
        lock(&self.state).sent_requests.clone()
    }

    pub fn history_requests(&self) -> Vec<GetMessagesRequest> {
        lock(&self.state).history_requests.clone()
    }

    fn online(&self) -> bool {
        !lock(&self.state).offline
    }
}

#[async_trait]
impl RemoteApi for MockApi {
    async fn send_message(&self, request: &SendMessageRequest) -> Option<Message> {
        let delay = {
            let mut state = lock(&self.state);
            state.sent_requests.push(request.clone());
            state.send_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.offline {
            return None;
        }
        state.next_id += 1;
        let message = Message {
            id: format!("srv-{}", state.next_id),
            local_id: None,
            content: request.content.clone(),
            author_id: "u1".into(),
            channel_id: request.channel_id.clone(),
            timestamp: Utc::now(),
            status: MessageStatus::Sent,
            reply_to: request.reply_to.clone(),
            edited_at: None,
        };
        state.messages.push(message.clone());
        Some(message)
    }

    async fn get_messages(&self, request: &GetMessagesRequest) -> Option<PaginatedResponse<Message>> {
        let mut state = lock(&self.state);
        state.history_requests.push(request.clone());
        if state.offline {
            return None;
        }
        let items: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.channel_id == request.channel_id)
            .cloned()
            .collect();
        Some(PaginatedResponse {
            total: items.len() as u64,
            page: request.page.unwrap_or(1),
            limit: request.limit.unwrap_or(50),
            has_more: false,
            items,
        })
    }

    async fn update_message(&self, message_id: &str, content: &str) -> Option<Message> {
        let mut state = lock(&self.state);
        if state.offline {
            return None;
        }
        let message = state.messages.iter_mut().find(|m| m.id == message_id)?;
        message.content = content.to_string();
        message.edited_at = Some(Utc::now());
        Some(message.clone())
    }

    async fn delete_message(&self, message_id: &str) -> bool {
        let mut state = lock(&self.state);
        if state.offline {
            return false;
        }
        let before = state.messages.len();
        state.messages.retain(|m| m.id != message_id);
        state.messages.len() != before
    }

    async fn get_channels(&self) -> Option<Vec<Channel>> {
        let state = lock(&self.state);
        (!state.offline).then(|| state.channels.clone())
    }

    async fn get_channel(&self, channel_id: &str) -> Option<Channel> {
        let state = lock(&self.state);
        if state.offline {
            return None;
        }
        state.channels.iter().find(|c| c.id == channel_id).cloned()
    }

    async fn create_channel(&self, request: &CreateChannelRequest) -> Option<Channel> {
        let mut state = lock(&self.state);
        if state.offline {
            return None;
        }
        let mut created = channel(&request.name.to_lowercase(), 100);
        created.name = request.name.clone();
        created.description = request.description.clone();
        state.channels.push(created.clone());
        Some(created)
    }

    async fn join_channel(&self, channel_id: &str) -> bool {
        let mut state = lock(&self.state);
        if state.offline {
            return false;
        }
        if !state.channels.iter().any(|c| c.id == channel_id) {
            let joined = channel(channel_id, 200);
            state.channels.push(joined);
        }
        true
    }

    async fn leave_channel(&self, channel_id: &str) -> bool {
        let mut state = lock(&self.state);
        if state.offline {
            return false;
        }
        state.channels.retain(|c| c.id != channel_id);
        true
    }
}
