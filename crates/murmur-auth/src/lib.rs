//! Credential primitives: bearer-token signing/verification and password
//! hashing. Nothing in here touches storage.

pub mod codec;
pub mod password;

pub use codec::{IssuedToken, TokenCodec, TokenConfig, TokenError};
pub use password::{PasswordCost, PasswordError, PasswordHasher};
