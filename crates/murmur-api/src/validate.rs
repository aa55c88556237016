//! Input checks for signup and login bodies. Everything that reaches
//! [`crate::session::SessionService`] has passed through here.
//!
//! The rules themselves are `validator` attributes on the request types;
//! this module normalizes the body first and hands back owned inputs.

use validator::Validate;

use murmur_types::api::{LoginRequest, SignupRequest};

use crate::error::AuthError;

#[derive(Debug)]
pub struct ValidSignup {
    pub username: String,
    /// Trimmed and lower-cased.
    pub email: String,
    pub password: String,
    /// Falls back to the username.
    pub display_name: String,
}

#[derive(Debug)]
pub struct ValidLogin {
    pub email: String,
    pub password: String,
}

pub fn signup(mut req: SignupRequest) -> Result<ValidSignup, AuthError> {
    req.username = req.username.trim().to_string();
    req.email = normalize_email(&req.email);
    req.display_name = req
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from);

    req.validate()?;

    let display_name = req.display_name.unwrap_or_else(|| req.username.clone());
    Ok(ValidSignup {
        username: req.username,
        email: req.email,
        password: req.password,
        display_name,
    })
}

pub fn login(mut req: LoginRequest) -> Result<ValidLogin, AuthError> {
    req.email = normalize_email(&req.email);
    req.validate()?;

    Ok(ValidLogin {
        email: req.email,
        password: req.password,
    })
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}
