//! Wire and domain types shared by every murmur crate.

pub mod api;
pub mod events;
pub mod models;
