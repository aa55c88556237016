use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use murmur_types::events::UserStatus;

use crate::channel::ChannelName;
use crate::registry::{Departure, Registration, RoomRegistry};

/// A user's status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: Uuid,
    pub status: UserStatus,
}

/// Transient online/offline tracking.
///
/// "Online" simply means the user's personal channel has at least one member.
/// Changes are published on a broadcast channel; fanning them out to a user's
/// contacts needs a contact list and is left to whoever subscribes.
#[derive(Clone)]
pub struct PresenceRelay {
    registry: RoomRegistry,
    changes: broadcast::Sender<PresenceChange>,
}

impl PresenceRelay {
    pub fn new(registry: RoomRegistry) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self { registry, changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        !self.registry.members_of(&ChannelName::user(user_id)).is_empty()
    }

    pub fn connected(&self, registration: &Registration) {
        if registration.first_for_user {
            self.publish(registration.user_id, UserStatus::Online);
        }
    }

    pub fn disconnected(&self, departure: &Departure) {
        if departure.last_for_user {
            self.publish(departure.user_id, UserStatus::Offline);
        }
    }

    /// Client-declared status (`update_status`).
    pub fn update_status(&self, user_id: Uuid, status: UserStatus) {
        self.publish(user_id, status);
    }

    fn publish(&self, user_id: Uuid, status: UserStatus) {
        debug!("Presence {} -> {:?}", user_id, status);
        // No subscribers is fine.
        let _ = self.changes.send(PresenceChange { user_id, status });
    }
}
