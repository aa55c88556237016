use std::fmt;

use uuid::Uuid;

/// A named broadcast group.
///
/// `user:<id>` is the personal channel every connection of that user joins at
/// handshake; `conversation:<id>` is joined and left on client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelName {
    User(Uuid),
    Conversation(Uuid),
}

impl ChannelName {
    pub fn user(id: Uuid) -> Self {
        Self::User(id)
    }

    pub fn conversation(id: Uuid) -> Self {
        Self::Conversation(id)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Conversation(id) => write!(f, "conversation:{id}"),
        }
    }
}
