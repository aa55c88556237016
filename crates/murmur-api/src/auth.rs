use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use serde_json::json;

use murmur_types::api::{
    HealthResponse, LoginRequest, LogoutRequest, OAuthRequest, RefreshRequest, SignupRequest,
};
use murmur_types::models::Identity;

use crate::error::AuthError;
use crate::session::SessionService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub sessions: SessionService,
    pub started_at: Instant,
}

pub async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(req) = payload?;
    let created = state.sessions.signup(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(req) = payload?;
    Ok(Json(state.sessions.login(req).await?))
}

pub async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(req) = payload?;
    Ok(Json(state.sessions.refresh(req.refresh_token).await?))
}

/// The body is optional; logging out without a token still succeeds.
pub async fn logout(
    State(state): State<AppState>,
    payload: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    state.sessions.logout(req.refresh_token).await?;
    Ok(Json(json!({ "message": "Logged out successfully" })))
}

pub async fn google(
    payload: Result<Json<OAuthRequest>, JsonRejection>,
) -> Result<StatusCode, AuthError> {
    let _ = payload?;
    Err(AuthError::NotImplemented("Google"))
}

pub async fn apple(
    payload: Result<Json<OAuthRequest>, JsonRejection>,
) -> Result<StatusCode, AuthError> {
    let _ = payload?;
    Err(AuthError::NotImplemented("Apple"))
}

/// Identity carried by the caller's access token. Requires
/// [`crate::middleware::require_auth`] in front.
pub async fn me(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use axum::middleware::from_fn_with_state;
    use axum::routing::{get, post};
    use chrono::Duration;
    use murmur_auth::{PasswordCost, PasswordHasher, TokenCodec, TokenConfig};
    use murmur_db::Database;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::middleware::require_auth;
    use crate::session::LoginPolicy;

    fn app() -> Router {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let codec = Arc::new(TokenCodec::new(&TokenConfig {
            access_secret: "http-access".into(),
            refresh_secret: "http-refresh".into(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
        }));
        let hasher = PasswordHasher::new(PasswordCost {
            memory_kib: 1024,
            iterations: 1,
        })
        .unwrap();
        let state: AppState = Arc::new(AppStateInner {
            sessions: SessionService::new(db, codec, hasher, LoginPolicy::default()),
            started_at: Instant::now(),
        });

        Router::new()
            .route("/auth/signup", post(signup))
            .route("/auth/login", post(login))
            .route("/auth/refresh", post(refresh))
            .route("/auth/logout", post(logout))
            .route("/auth/google", post(google))
            .route(
                "/auth/me",
                get(me).layer(from_fn_with_state(state.clone(), require_auth)),
            )
            .route("/health", get(health))
            .with_state(state)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn signup_body() -> Value {
        json!({ "username": "alice", "email": "a@x.com", "password": "Passw0rd" })
    }

    #[tokio::test]
    async fn signup_returns_201_then_409() {
        let app = app();

        let resp = app
            .clone()
            .oneshot(post_json("/auth/signup", signup_body()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["user"]["username"], "alice");
        assert!(body["accessToken"].is_string());
        assert!(body["refreshToken"].is_string());

        let resp = app
            .oneshot(post_json("/auth/signup", signup_body()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["error"], "Conflict");
    }

    #[tokio::test]
    async fn malformed_body_is_400_with_error_body() {
        let resp = app()
            .oneshot(post_json("/auth/login", json!({ "email": "a@x.com" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "ValidationError");
    }

    #[tokio::test]
    async fn me_requires_a_valid_access_token() {
        let app = app();

        let resp = app
            .clone()
            .oneshot(Request::get("/auth/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let created = body_json(
            app.clone()
                .oneshot(post_json("/auth/signup", signup_body()))
                .await
                .unwrap(),
        )
        .await;
        let access = created["accessToken"].as_str().unwrap();
        let refresh_token = created["refreshToken"].as_str().unwrap();

        // A refresh token is not accepted as a bearer credential.
        let resp = app
            .clone()
            .oneshot(
                Request::get("/auth/me")
                    .header(header::AUTHORIZATION, format!("Bearer {refresh_token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::get("/auth/me")
                    .header(header::AUTHORIZATION, format!("Bearer {access}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["username"], "alice");
    }

    #[tokio::test]
    async fn refresh_then_reuse_is_401() {
        let app = app();
        let created = body_json(
            app.clone()
                .oneshot(post_json("/auth/signup", signup_body()))
                .await
                .unwrap(),
        )
        .await;
        let token = created["refreshToken"].clone();

        let resp = app
            .clone()
            .oneshot(post_json("/auth/refresh", json!({ "refreshToken": token })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(post_json("/auth/refresh", json!({ "refreshToken": token })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "RevokedRefreshToken");
    }

    #[tokio::test]
    async fn logout_without_body_and_oauth_stub() {
        let app = app();

        let resp = app
            .clone()
            .oneshot(Request::post("/auth/logout").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(post_json("/auth/google", json!({ "idToken": "whatever" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let resp = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }
}
