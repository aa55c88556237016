use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessageEnvelope;

/// Events sent FROM client TO server over the WebSocket gateway.
///
/// Frames look like `{"event": "send_message", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Start receiving `new_message` for a conversation.
    JoinConversation(Uuid),

    /// Stop receiving `new_message` for a conversation.
    LeaveConversation(Uuid),

    SendMessage(SendMessage),

    TypingStart(TypingTarget),

    TypingStop(TypingTarget),

    MessageRead(MessageRead),

    UpdateStatus(UserStatus),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: Uuid,
    pub receiver_id: Uuid,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingTarget {
    pub conversation_id: Uuid,
    pub receiver_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub sender_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Away,
    Offline,
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake accepted; the personal channel is already joined.
    Ready(Ready),

    NewMessage(MessageEnvelope),

    Notification(Notification),

    UserTyping(UserTyping),

    MessageReadReceipt(ReadReceipt),

    Error(ErrorEvent),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    Like,
    Comment,
    Follow,
    Mention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub sender_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub read_by: Uuid,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_conversation_takes_bare_id() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"event":"join_conversation","data":"{id}"}}"#);
        match serde_json::from_str::<ClientEvent>(&raw).unwrap() {
            ClientEvent::JoinConversation(got) => assert_eq!(got, id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn send_message_uses_camel_case_fields() {
        let conv = Uuid::new_v4();
        let recv = Uuid::new_v4();
        let raw = format!(
            r#"{{"event":"send_message","data":{{"conversationId":"{conv}","receiverId":"{recv}","text":"hey"}}}}"#
        );
        match serde_json::from_str::<ClientEvent>(&raw).unwrap() {
            ClientEvent::SendMessage(msg) => {
                assert_eq!(msg.conversation_id, conv);
                assert_eq!(msg.receiver_id, recv);
                assert_eq!(msg.text.as_deref(), Some("hey"));
                assert!(msg.media_url.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn update_status_is_lowercase() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"update_status","data":"away"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::UpdateStatus(UserStatus::Away)));
    }

    #[test]
    fn notification_serializes_type_field() {
        let ev = ServerEvent::Notification(Notification {
            kind: NotificationKind::Message,
            sender_id: Uuid::nil(),
            conversation_id: Some(Uuid::nil()),
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "notification");
        assert_eq!(json["data"]["type"], "message");
        assert!(json["data"]["senderId"].is_string());
    }
}
