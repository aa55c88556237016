//! REST surface of murmur: account signup and login, refresh-token rotation,
//! logout, and the bearer middleware that guards authenticated routes.

pub mod auth;
pub mod error;
pub mod middleware;
pub mod session;
pub mod validate;

pub use auth::{AppState, AppStateInner};
pub use error::AuthError;
pub use session::{LoginPolicy, SessionService};
