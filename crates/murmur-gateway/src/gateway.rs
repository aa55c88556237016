use std::sync::Arc;

use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use murmur_auth::{TokenCodec, TokenError};
use murmur_types::api::ErrorResponse;
use murmur_types::events::{Ready, ServerEvent};
use murmur_types::models::Identity;

use crate::presence::PresenceRelay;
use crate::registry::{ConnectionId, RoomRegistry};
use crate::router::MessageRouter;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Authentication token required")]
    AuthenticationRequired,

    #[error("Invalid authentication token")]
    AuthenticationFailed(#[source] TokenError),
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let error = match self {
            Self::AuthenticationRequired => "AuthenticationRequired",
            Self::AuthenticationFailed(_) => "AuthenticationFailed",
        };
        let body = ErrorResponse {
            error: error.into(),
            message: self.to_string(),
        };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Pull the bearer token out of a handshake: `Authorization: Bearer ...`
/// first, then the `token` query parameter. Blank values count as missing.
pub fn bearer_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    from_header
        .or(query_token.map(str::trim))
        .filter(|t| !t.is_empty())
}

/// Entry point for realtime connections: authenticates the handshake and
/// wires an accepted connection into the registry.
#[derive(Clone)]
pub struct ConnectionGateway {
    codec: Arc<TokenCodec>,
    registry: RoomRegistry,
    router: MessageRouter,
    presence: PresenceRelay,
}

impl ConnectionGateway {
    pub fn new(
        codec: Arc<TokenCodec>,
        registry: RoomRegistry,
        router: MessageRouter,
        presence: PresenceRelay,
    ) -> Self {
        Self {
            codec,
            registry,
            router,
            presence,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn presence(&self) -> &PresenceRelay {
        &self.presence
    }

    /// Runs before the upgrade completes. A failure creates no state; the
    /// client has to come back with a fresh access token.
    pub fn authenticate(&self, token: Option<&str>) -> Result<Identity, HandshakeError> {
        let token = token.ok_or(HandshakeError::AuthenticationRequired)?;

        self.codec.verify_access(token).map_err(|e| {
            warn!("Gateway handshake rejected: {}", e);
            HandshakeError::AuthenticationFailed(e)
        })
    }

    /// Register an authenticated connection. Its personal channel is joined
    /// before this returns, and a `ready` event is already queued.
    pub fn accept(&self, identity: Identity) -> Session {
        let (tx, outbound) = mpsc::unbounded_channel();
        let registration = self.registry.register(identity.user_id, tx);
        self.presence.connected(&registration);

        self.registry.send_to(
            registration.conn_id,
            ServerEvent::Ready(Ready {
                user_id: identity.user_id,
                username: identity.username.clone(),
            }),
        );

        info!(
            "{} ({}) connected to gateway as {}",
            identity.username, identity.user_id, registration.conn_id
        );

        Session {
            conn_id: registration.conn_id,
            identity,
            outbound,
            guard: ConnectionGuard {
                conn_id: registration.conn_id,
                registry: self.registry.clone(),
                presence: self.presence.clone(),
            },
        }
    }
}

/// A live, authenticated connection. Dropping it releases every channel
/// membership the connection holds.
pub struct Session {
    pub conn_id: ConnectionId,
    pub identity: Identity,
    pub outbound: mpsc::UnboundedReceiver<ServerEvent>,
    pub guard: ConnectionGuard,
}

/// Releases the connection from the registry exactly once, on drop. Works
/// the same whether the connection loop ended normally or was aborted.
pub struct ConnectionGuard {
    conn_id: ConnectionId,
    registry: RoomRegistry,
    presence: PresenceRelay,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(departure) = self.registry.disconnect(self.conn_id) {
            self.presence.disconnected(&departure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Duration;
    use murmur_auth::TokenConfig;
    use murmur_db::Database;
    use uuid::Uuid;

    use crate::channel::ChannelName;

    fn gateway_with_ttl(access_ttl: Duration) -> ConnectionGateway {
        let codec = Arc::new(TokenCodec::new(&TokenConfig {
            access_secret: "gw-access".into(),
            refresh_secret: "gw-refresh".into(),
            access_ttl,
            refresh_ttl: Duration::days(7),
        }));
        let registry = RoomRegistry::new();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let router = MessageRouter::new(registry.clone(), db);
        let presence = PresenceRelay::new(registry.clone());
        ConnectionGateway::new(codec, registry, router, presence)
    }

    fn alice() -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            email: "a@x.com".into(),
        }
    }

    #[test]
    fn header_token_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        assert_eq!(bearer_token(&headers, Some("from-query")), Some("from-header"));
        assert_eq!(bearer_token(&HeaderMap::new(), Some("from-query")), Some("from-query"));
        assert_eq!(bearer_token(&HeaderMap::new(), Some("  ")), None);
        assert_eq!(bearer_token(&HeaderMap::new(), None), None);
    }

    #[test]
    fn missing_token_is_authentication_required() {
        let gw = gateway_with_ttl(Duration::minutes(15));
        assert!(matches!(
            gw.authenticate(None),
            Err(HandshakeError::AuthenticationRequired)
        ));
        assert_eq!(gw.registry().connection_count(), 0);
    }

    #[test]
    fn expired_token_is_rejected_without_membership() {
        let gw = gateway_with_ttl(Duration::seconds(-120));
        let who = alice();
        let token = gw.codec.issue_access(&who).unwrap().token;

        let err = gw.authenticate(Some(&token)).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::AuthenticationFailed(TokenError::Expired)
        ));
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        assert_eq!(gw.registry().connection_count(), 0);
        assert!(gw.registry().members_of(&ChannelName::user(who.user_id)).is_empty());
    }

    #[test]
    fn refresh_token_cannot_open_a_connection() {
        let gw = gateway_with_ttl(Duration::minutes(15));
        let refresh = gw.codec.issue_refresh(&alice()).unwrap().token;

        assert!(matches!(
            gw.authenticate(Some(&refresh)),
            Err(HandshakeError::AuthenticationFailed(TokenError::Malformed))
        ));
    }

    #[test]
    fn accepted_connection_joins_personal_channel_and_gets_ready() {
        let gw = gateway_with_ttl(Duration::minutes(15));
        let who = alice();
        let token = gw.codec.issue_access(&who).unwrap().token;

        let identity = gw.authenticate(Some(&token)).unwrap();
        assert_eq!(identity, who);

        let mut session = gw.accept(identity);
        let personal = ChannelName::user(who.user_id);
        assert!(gw.registry().members_of(&personal).contains(&session.conn_id));
        assert!(gw.presence().is_online(who.user_id));

        match session.outbound.try_recv() {
            Ok(ServerEvent::Ready(ready)) => assert_eq!(ready.user_id, who.user_id),
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn dropping_session_releases_membership() {
        let gw = gateway_with_ttl(Duration::minutes(15));
        let who = alice();
        let session = gw.accept(who.clone());
        let conversation = ChannelName::conversation(Uuid::new_v4());
        gw.registry().join(session.conn_id, conversation);
        let mut changes = gw.presence().subscribe();

        drop(session);

        assert_eq!(gw.registry().connection_count(), 0);
        assert!(gw.registry().members_of(&conversation).is_empty());
        assert!(!gw.presence().is_online(who.user_id));
        assert_eq!(
            changes.try_recv().unwrap().status,
            murmur_types::events::UserStatus::Offline
        );
    }
}
