use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use murmur_db::models::NewMessage;
use murmur_db::{Database, DbError};
use murmur_types::events::{
    MessageRead, Notification, NotificationKind, ReadReceipt, SendMessage, ServerEvent, TypingTarget,
    UserTyping,
};
use murmur_types::models::{Identity, MessageEnvelope};

use crate::channel::ChannelName;
use crate::registry::RoomRegistry;

pub const MAX_TEXT_CHARS: usize = 4000;
pub const MAX_MEDIA_URL_CHARS: usize = 2048;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("{0}")]
    Invalid(&'static str),

    #[error("failed to store message")]
    Storage(#[source] DbError),

    #[error("message store task failed")]
    Task(#[from] tokio::task::JoinError),
}

impl RouteError {
    /// Text sent back to the client in an `error` event.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::Invalid(reason) => reason,
            Self::Storage(_) | Self::Task(_) => "Failed to send message",
        }
    }
}

/// Delivers client-originated events to the right channels, and lets
/// server-side code push notifications to a user.
///
/// Delivery is at-most-once: whoever is not connected right now misses it.
#[derive(Clone)]
pub struct MessageRouter {
    registry: RoomRegistry,
    db: Arc<Database>,
}

impl MessageRouter {
    pub fn new(registry: RoomRegistry, db: Arc<Database>) -> Self {
        Self { registry, db }
    }

    /// Validate, persist, then fan out. The envelope carries the id the store
    /// assigned; nothing is broadcast if persisting fails.
    pub async fn send_message(
        &self,
        sender: &Identity,
        msg: SendMessage,
    ) -> Result<MessageEnvelope, RouteError> {
        let (text, media_url) = validate_content(msg.text, msg.media_url)?;

        let db = self.db.clone();
        let sender_id = sender.user_id;
        let row = tokio::task::spawn_blocking(move || {
            db.insert_message(&NewMessage {
                conversation_id: msg.conversation_id,
                sender_id,
                receiver_id: msg.receiver_id,
                text: text.as_deref(),
                media_url: media_url.as_deref(),
            })
        })
        .await?
        .map_err(|e| {
            error!("Failed to store message from {}: {}", sender_id, e);
            RouteError::Storage(e)
        })?;

        let envelope = MessageEnvelope::from(row);

        let reached = self.broadcast_message(envelope.clone());

        self.notify_user(
            envelope.receiver_id,
            Notification {
                kind: NotificationKind::Message,
                sender_id,
                conversation_id: Some(envelope.conversation_id),
            },
        );

        debug!(
            "Message {} in conversation {} reached {} connections",
            envelope.id, envelope.conversation_id, reached
        );
        Ok(envelope)
    }

    pub fn emit_typing(&self, sender_id: Uuid, target: &TypingTarget, is_typing: bool) -> usize {
        self.registry.emit(
            &ChannelName::user(target.receiver_id),
            &ServerEvent::UserTyping(UserTyping {
                conversation_id: target.conversation_id,
                user_id: sender_id,
                is_typing,
            }),
        )
    }

    /// Tell the original sender that `reader_id` has read their message.
    pub fn emit_read_receipt(&self, reader_id: Uuid, read: &MessageRead) -> usize {
        self.registry.emit(
            &ChannelName::user(read.sender_id),
            &ServerEvent::MessageReadReceipt(ReadReceipt {
                conversation_id: read.conversation_id,
                message_id: read.message_id,
                read_by: reader_id,
                read_at: Utc::now(),
            }),
        )
    }

    /// Push a notification to every live connection of `user_id`.
    pub fn notify_user(&self, user_id: Uuid, notification: Notification) -> usize {
        self.registry
            .emit(&ChannelName::user(user_id), &ServerEvent::Notification(notification))
    }

    /// Deliver an already-stored message to a conversation's members.
    pub fn broadcast_message(&self, envelope: MessageEnvelope) -> usize {
        self.registry.emit(
            &ChannelName::conversation(envelope.conversation_id),
            &ServerEvent::NewMessage(envelope),
        )
    }
}

/// At least one of text / media URL must carry something. Blank strings
/// count as absent.
fn validate_content(
    text: Option<String>,
    media_url: Option<String>,
) -> Result<(Option<String>, Option<String>), RouteError> {
    let text = text.filter(|t| !t.trim().is_empty());
    let media_url = media_url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty());

    if text.is_none() && media_url.is_none() {
        return Err(RouteError::Invalid("Message must have text or media"));
    }
    if text.as_ref().is_some_and(|t| t.chars().count() > MAX_TEXT_CHARS) {
        return Err(RouteError::Invalid("Message text is too long"));
    }
    if media_url
        .as_ref()
        .is_some_and(|u| u.chars().count() > MAX_MEDIA_URL_CHARS)
    {
        return Err(RouteError::Invalid("Media URL is too long"));
    }

    Ok((text, media_url))
}
