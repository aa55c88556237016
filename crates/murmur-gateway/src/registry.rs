use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_types::events::ServerEvent;

use crate::channel::ChannelName;

pub type ConnectionId = Uuid;

/// Outbound queue of a single connection.
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

struct ConnectionEntry {
    user_id: Uuid,
    tx: Outbound,
    channels: HashSet<ChannelName>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Reverse index: channel -> member connections. Empty sets are removed.
    channels: HashMap<ChannelName, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn add_member(&mut self, conn_id: ConnectionId, channel: ChannelName) -> bool {
        let Some(entry) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !entry.channels.insert(channel) {
            return false;
        }
        self.channels.entry(channel).or_default().insert(conn_id);
        true
    }

    fn remove_member(&mut self, conn_id: ConnectionId, channel: &ChannelName) -> bool {
        let Some(entry) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !entry.channels.remove(channel) {
            return false;
        }
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
        true
    }

    fn member_count(&self, channel: &ChannelName) -> usize {
        self.channels.get(channel).map_or(0, HashSet::len)
    }
}

/// Result of registering a connection.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub conn_id: ConnectionId,
    pub user_id: Uuid,
    /// No other connection of this user was registered.
    pub first_for_user: bool,
}

/// Result of removing a connection.
#[derive(Debug, Clone, Copy)]
pub struct Departure {
    pub conn_id: ConnectionId,
    pub user_id: Uuid,
    /// This was the user's last connection.
    pub last_for_user: bool,
}

/// Which connections are in which channels, and how to reach them.
///
/// Both indices sit behind one lock, so a connection's joins, leaves and its
/// final disconnect are applied atomically and in the order that connection
/// issued them. The lock is never held across an `.await`.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection and put it in its owner's personal channel in the
    /// same step.
    pub fn register(&self, user_id: Uuid, tx: Outbound) -> Registration {
        let conn_id = Uuid::new_v4();
        let personal = ChannelName::user(user_id);

        let mut state = self.write();
        state.connections.insert(
            conn_id,
            ConnectionEntry {
                user_id,
                tx,
                channels: HashSet::new(),
            },
        );
        state.add_member(conn_id, personal);
        let first_for_user = state.member_count(&personal) == 1;

        debug!("Registered connection {} for {}", conn_id, user_id);
        Registration {
            conn_id,
            user_id,
            first_for_user,
        }
    }

    /// Idempotent. Returns `true` if the membership was added by this call;
    /// unknown connections are ignored.
    pub fn join(&self, conn_id: ConnectionId, channel: ChannelName) -> bool {
        self.write().add_member(conn_id, channel)
    }

    /// Idempotent. Returns `true` if the membership was removed by this call.
    pub fn leave(&self, conn_id: ConnectionId, channel: &ChannelName) -> bool {
        self.write().remove_member(conn_id, channel)
    }

    pub fn members_of(&self, channel: &ChannelName) -> HashSet<ConnectionId> {
        self.read().channels.get(channel).cloned().unwrap_or_default()
    }

    pub fn channels_of(&self, conn_id: ConnectionId) -> HashSet<ChannelName> {
        self.read()
            .connections
            .get(&conn_id)
            .map(|entry| entry.channels.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, conn_id: ConnectionId) -> bool {
        self.read().connections.contains_key(&conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    /// Drop the connection and every membership it holds. Only the first
    /// call for a given connection returns `Some`.
    pub fn disconnect(&self, conn_id: ConnectionId) -> Option<Departure> {
        let mut state = self.write();
        let entry = state.connections.remove(&conn_id)?;

        for channel in &entry.channels {
            if let Some(members) = state.channels.get_mut(channel) {
                members.remove(&conn_id);
                if members.is_empty() {
                    state.channels.remove(channel);
                }
            }
        }

        let last_for_user = state.member_count(&ChannelName::user(entry.user_id)) == 0;
        debug!(
            "Released connection {} ({} channels)",
            conn_id,
            entry.channels.len()
        );

        Some(Departure {
            conn_id,
            user_id: entry.user_id,
            last_for_user,
        })
    }

    /// Queue an event on one connection. Returns `false` if it is gone.
    pub fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) -> bool {
        self.read()
            .connections
            .get(&conn_id)
            .is_some_and(|entry| entry.tx.send(event).is_ok())
    }

    /// Fan an event out to every current member of `channel`. Returns the
    /// number of connections it was queued on. Best effort: closed
    /// connections are skipped, nothing is kept for later.
    pub fn emit(&self, channel: &ChannelName, event: &ServerEvent) -> usize {
        let state = self.read();
        let Some(members) = state.channels.get(channel) else {
            return 0;
        };

        members
            .iter()
            .filter_map(|conn_id| state.connections.get(conn_id))
            .filter(|entry| entry.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Drop every connection and membership. Outbound queues close, which
    /// ends each connection's send loop.
    pub fn shutdown(&self) -> usize {
        let mut state = self.write();
        let closed = state.connections.len();
        state.connections.clear();
        state.channels.clear();
        info!("Room registry shut down ({} connections closed)", closed);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(registry: &RoomRegistry, user: Uuid) -> (Registration, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(user, tx), rx)
    }

    #[test]
    fn register_joins_personal_channel() {
        let registry = RoomRegistry::new();
        let user = Uuid::new_v4();
        let (reg, _rx) = connect(&registry, user);

        assert!(reg.first_for_user);
        assert_eq!(
            registry.channels_of(reg.conn_id),
            HashSet::from([ChannelName::user(user)])
        );
        assert!(registry.members_of(&ChannelName::user(user)).contains(&reg.conn_id));

        let (second, _rx2) = connect(&registry, user);
        assert!(!second.first_for_user);
    }

    #[test]
    fn join_then_leave_restores_membership() {
        let registry = RoomRegistry::new();
        let (reg, _rx) = connect(&registry, Uuid::new_v4());
        let conv = ChannelName::conversation(Uuid::new_v4());

        let before = registry.channels_of(reg.conn_id);

        assert!(registry.join(reg.conn_id, conv));
        assert!(!registry.join(reg.conn_id, conv));
        assert_eq!(registry.members_of(&conv).len(), 1);

        assert!(registry.leave(reg.conn_id, &conv));
        assert!(!registry.leave(reg.conn_id, &conv));

        assert_eq!(registry.channels_of(reg.conn_id), before);
        assert!(registry.members_of(&conv).is_empty());
    }

    #[test]
    fn unknown_connection_cannot_join() {
        let registry = RoomRegistry::new();
        let conv = ChannelName::conversation(Uuid::new_v4());

        assert!(!registry.join(Uuid::new_v4(), conv));
        assert!(registry.members_of(&conv).is_empty());
    }

    #[test]
    fn disconnect_clears_only_that_connection() {
        let registry = RoomRegistry::new();
        let conv = ChannelName::conversation(Uuid::new_v4());
        let (a, _rx_a) = connect(&registry, Uuid::new_v4());
        let (b, _rx_b) = connect(&registry, Uuid::new_v4());
        registry.join(a.conn_id, conv);
        registry.join(b.conn_id, conv);

        let b_before = registry.channels_of(b.conn_id);

        let departure = registry.disconnect(a.conn_id).unwrap();
        assert_eq!(departure.user_id, a.user_id);
        assert!(departure.last_for_user);

        assert!(!registry.is_connected(a.conn_id));
        assert!(registry.channels_of(a.conn_id).is_empty());
        assert!(registry.members_of(&ChannelName::user(a.user_id)).is_empty());
        assert_eq!(registry.members_of(&conv), HashSet::from([b.conn_id]));
        assert_eq!(registry.channels_of(b.conn_id), b_before);

        // Second release is a no-op.
        assert!(registry.disconnect(a.conn_id).is_none());
    }

    #[test]
    fn last_for_user_tracks_remaining_connections() {
        let registry = RoomRegistry::new();
        let user = Uuid::new_v4();
        let (first, _rx1) = connect(&registry, user);
        let (second, _rx2) = connect(&registry, user);

        assert!(!registry.disconnect(first.conn_id).unwrap().last_for_user);
        assert!(registry.disconnect(second.conn_id).unwrap().last_for_user);
    }

    #[test]
    fn emit_reaches_members_only() {
        let registry = RoomRegistry::new();
        let conv = ChannelName::conversation(Uuid::new_v4());
        let (a, mut rx_a) = connect(&registry, Uuid::new_v4());
        let (b, mut rx_b) = connect(&registry, Uuid::new_v4());
        let (_c, mut rx_c) = connect(&registry, Uuid::new_v4());
        registry.join(a.conn_id, conv);
        registry.join(b.conn_id, conv);

        let delivered = registry.emit(&conv, &ServerEvent::error("ping"));
        assert_eq!(delivered, 2);

        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::Error(_))));
        assert!(matches!(rx_b.try_recv(), Ok(ServerEvent::Error(_))));
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn emit_skips_closed_receivers() {
        let registry = RoomRegistry::new();
        let user = Uuid::new_v4();
        let (_live, mut rx_live) = connect(&registry, user);
        let (_dead, rx_dead) = connect(&registry, user);
        drop(rx_dead);

        assert_eq!(registry.emit(&ChannelName::user(user), &ServerEvent::error("x")), 1);
        assert!(rx_live.try_recv().is_ok());
    }

    #[test]
    fn shutdown_closes_everything() {
        let registry = RoomRegistry::new();
        let (reg, mut rx) = connect(&registry, Uuid::new_v4());

        assert_eq!(registry.shutdown(), 1);
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.channels_of(reg.conn_id).is_empty());
        // Sender dropped with the entry.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
