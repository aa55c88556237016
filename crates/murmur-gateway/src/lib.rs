//! Realtime side of murmur: WebSocket handshake, channel membership, event
//! routing and presence.
//!
//! All state here is process-local. Running more than one server process
//! would need a shared broadcast bus in front of [`registry::RoomRegistry`].

pub mod channel;
pub mod connection;
pub mod gateway;
pub mod presence;
pub mod registry;
pub mod router;

pub use channel::ChannelName;
pub use gateway::{ConnectionGateway, HandshakeError};
pub use presence::{PresenceChange, PresenceRelay};
pub use registry::{ConnectionId, RoomRegistry};
pub use router::{MessageRouter, RouteError};
