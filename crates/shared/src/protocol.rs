//! Realtime event frames exchanged over the WebSocket.
//!
//! Every inbound frame is a JSON object of the form
//! `{"type": "message:received", "timestamp": "...", "data": {...}}`.
//! The only outbound control frame is the heartbeat, `{"type":"ping"}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::models::{Channel, Message, User};

/// Wire names of every event kind the client understands.
pub const EVENT_TYPES: [&str; 9] = [
    "message:sent",
    "message:received",
    "message:updated",
    "message:deleted",
    "channel:created",
    "channel:updated",
    "user:typing",
    "user:online",
    "user:offline",
];

/// An inbound realtime event. Events are applied, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum EventKind {
    #[serde(rename = "message:sent")]
    MessageSent(MessagePayload),
    #[serde(rename = "message:received")]
    MessageReceived(MessagePayload),
    #[serde(rename = "message:updated")]
    MessageUpdated(MessagePayload),
    #[serde(rename = "message:deleted")]
    MessageDeleted(MessageDeletedPayload),
    #[serde(rename = "channel:created")]
    ChannelCreated(ChannelPayload),
    #[serde(rename = "channel:updated")]
    ChannelUpdated(ChannelPayload),
    #[serde(rename = "user:typing")]
    UserTyping(TypingPayload),
    #[serde(rename = "user:online")]
    UserOnline(PresencePayload),
    #[serde(rename = "user:offline")]
    UserOffline(PresencePayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub message_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPayload {
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: String,
    pub channel_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user: User,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Parse a textual frame.
    ///
    /// A frame whose `type` is not one of [`EVENT_TYPES`] is reported as
    /// [`FrameError::UnknownType`] so callers can tell it apart from garbage.
    pub fn from_frame(text: &str) -> Result<Self, FrameError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
            return Err(FrameError::Malformed("missing event type".to_string()));
        };
        if !EVENT_TYPES.contains(&kind) {
            return Err(FrameError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    /// Wire name of this event's kind.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Channel the event concerns, if any.
    pub fn channel_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::MessageSent(p) | EventKind::MessageReceived(p) | EventKind::MessageUpdated(p) => {
                Some(&p.message.channel_id)
            }
            EventKind::MessageDeleted(p) => Some(&p.channel_id),
            EventKind::ChannelCreated(p) | EventKind::ChannelUpdated(p) => Some(&p.channel.id),
            EventKind::UserTyping(p) => Some(&p.channel_id),
            EventKind::UserOnline(_) | EventKind::UserOffline(_) => None,
        }
    }
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::MessageSent(_) => "message:sent",
            EventKind::MessageReceived(_) => "message:received",
            EventKind::MessageUpdated(_) => "message:updated",
            EventKind::MessageDeleted(_) => "message:deleted",
            EventKind::ChannelCreated(_) => "channel:created",
            EventKind::ChannelUpdated(_) => "channel:updated",
            EventKind::UserTyping(_) => "user:typing",
            EventKind::UserOnline(_) => "user:online",
            EventKind::UserOffline(_) => "user:offline",
        }
    }
}

/// Outbound control frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Heartbeat keepalive.
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIVED: &str = r#"{
        "type": "message:received",
        "timestamp": "2024-05-01T10:00:00Z",
        "data": {
            "message": {
                "id": "srv-1",
                "content": "hello",
                "authorId": "u2",
                "channelId": "general",
                "timestamp": "2024-05-01T09:59:59Z",
                "status": "sent"
            }
        }
    }"#;

    #[test]
    fn parses_message_event() {
        let event = Event::from_frame(RECEIVED).unwrap();
        assert_eq!(event.type_name(), "message:received");
        assert_eq!(event.channel_id(), Some("general"));
        let EventKind::MessageReceived(payload) = event.kind else {
            panic!("wrong kind");
        };
        assert_eq!(payload.message.id, "srv-1");
        assert!(payload.message.local_id.is_none());
    }

    #[test]
    fn parses_deleted_event() {
        let frame = r#"{"type":"message:deleted","timestamp":"2024-05-01T10:00:00Z",
            "data":{"messageId":"srv-1","channelId":"general"}}"#;
        let event = Event::from_frame(frame).unwrap();
        assert_eq!(
            event.kind,
            EventKind::MessageDeleted(MessageDeletedPayload {
                message_id: "srv-1".into(),
                channel_id: "general".into(),
            })
        );
    }

    #[test]
    fn unknown_type_is_distinguished_from_garbage() {
        let unknown = r#"{"type":"pong","timestamp":"2024-05-01T10:00:00Z"}"#;
        assert_eq!(
            Event::from_frame(unknown),
            Err(FrameError::UnknownType("pong".into()))
        );
        assert!(matches!(
            Event::from_frame("not json"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            Event::from_frame(r#"{"type":"message:received","timestamp":"x","data":{}}"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn ping_frame_shape() {
        assert_eq!(
            serde_json::to_string(&ControlFrame::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );
    }

    #[test]
    fn serialized_event_parses_back() {
        let event = Event::from_frame(RECEIVED).unwrap();
        let text = serde_json::to_string(&event).unwrap();
        assert_eq!(Event::from_frame(&text).unwrap(), event);
    }
}
