//! Database row types. Distinct from murmur-types API models to keep the DB
//! layer independent; conversions live next to the rows.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use murmur_types::models::{MessageEnvelope, UserProfile};

pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_private: bool,
    pub is_verified: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl UserRow {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
            is_private: self.is_private,
            is_verified: self.is_verified,
        }
    }
}

pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub display_name: Option<&'a str>,
}

pub struct NewMessage<'a> {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub text: Option<&'a str>,
    pub media_url: Option<&'a str>,
}

pub struct MessageRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for MessageEnvelope {
    fn from(row: MessageRow) -> Self {
        MessageEnvelope {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            text: row.text,
            media_url: row.media_url,
            created_at: row.created_at,
        }
    }
}
