use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;

use murmur_auth::TokenError;

use crate::auth::AppState;
use crate::error::AuthError;

/// Verify the bearer access token and attach its
/// [`Identity`](murmur_types::models::Identity) to the request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(AuthError::MissingToken)?;

    let identity = state
        .sessions
        .codec()
        .verify_access(bearer.token())
        .map_err(|e| match e {
            TokenError::Expired => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
