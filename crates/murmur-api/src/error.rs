use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;
use validator::ValidationErrors;

use murmur_auth::{PasswordError, TokenError};
use murmur_db::DbError;
use murmur_types::api::ErrorResponse;

/// Every way an auth request can fail, with the HTTP status it maps to.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("An account with this username or email already exists")]
    Conflict,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account has been deactivated")]
    DeactivatedAccount,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Refresh token has been revoked")]
    RevokedRefreshToken,

    #[error("Refresh token has expired")]
    ExpiredRefreshToken,

    #[error("Authentication token required")]
    MissingToken,

    #[error("Access token has expired")]
    TokenExpired,

    #[error("Invalid access token")]
    InvalidToken,

    #[error("{0} sign-in is not implemented")]
    NotImplemented(&'static str),

    #[error("Service temporarily unavailable, try again")]
    ServiceUnavailable(#[source] DbError),

    #[error("Internal server error")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict => StatusCode::CONFLICT,
            Self::DeactivatedAccount => StatusCode::FORBIDDEN,
            Self::InvalidCredentials
            | Self::InvalidRefreshToken
            | Self::RevokedRefreshToken
            | Self::ExpiredRefreshToken
            | Self::MissingToken
            | Self::TokenExpired
            | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable name, used as the `error` field of the body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Conflict => "Conflict",
            Self::InvalidCredentials => "InvalidCredentials",
            Self::DeactivatedAccount => "DeactivatedAccount",
            Self::InvalidRefreshToken => "InvalidRefreshToken",
            Self::RevokedRefreshToken => "RevokedRefreshToken",
            Self::ExpiredRefreshToken => "ExpiredRefreshToken",
            Self::MissingToken => "AuthenticationRequired",
            Self::TokenExpired => "TokenExpired",
            Self::InvalidToken => "InvalidToken",
            Self::NotImplemented(_) => "NotImplemented",
            Self::ServiceUnavailable(_) => "ServiceUnavailable",
            Self::Internal(_) => "InternalError",
        }
    }
}

impl From<DbError> for AuthError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Conflict(_) => Self::Conflict,
            e if e.is_transient() => Self::ServiceUnavailable(e),
            e => Self::Internal(e.to_string()),
        }
    }
}

impl From<PasswordError> for AuthError {
    fn from(e: PasswordError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Only reached when *issuing* a token; verification failures are mapped
/// explicitly at each call site.
impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<JsonRejection> for AuthError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

/// Reports one failing rule. Fields are taken in name order so the same
/// body always yields the same message.
impl From<ValidationErrors> for AuthError {
    fn from(errors: ValidationErrors) -> Self {
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        let message = fields
            .into_iter()
            .find_map(|(field, errs)| {
                errs.first().map(|e| match &e.message {
                    Some(message) => message.to_string(),
                    None => format!("{field} is invalid"),
                })
            })
            .unwrap_or_else(|| "Invalid request body".to_string());
        Self::Validation(message)
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(detail) => error!("Internal error: {}", detail),
            Self::ServiceUnavailable(source) => error!("Storage unavailable: {}", source),
            _ => {}
        }

        let body = ErrorResponse {
            error: self.code().into(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
