mod cleanup;
mod config;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, Method, header::{AUTHORIZATION, CONTENT_TYPE}},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use murmur_api::auth::{self, AppState, AppStateInner};
use murmur_api::middleware::require_auth;
use murmur_api::SessionService;
use murmur_auth::{PasswordHasher, TokenCodec};
use murmur_db::{Database, TokenLedger};
use murmur_gateway::gateway::bearer_token;
use murmur_gateway::{ConnectionGateway, MessageRouter, PresenceRelay, RoomRegistry, connection};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    let codec = Arc::new(TokenCodec::new(&config.tokens));
    let hasher = PasswordHasher::new(config.password_cost)?;
    let sessions = SessionService::new(db.clone(), codec.clone(), hasher, config.login_policy);

    let registry = RoomRegistry::new();
    let router = MessageRouter::new(registry.clone(), db.clone());
    let presence = PresenceRelay::new(registry.clone());
    let gateway = ConnectionGateway::new(codec, registry.clone(), router, presence.clone());

    tokio::spawn(cleanup::run_cleanup_loop(
        TokenLedger::new(db),
        config.cleanup_interval_secs,
    ));
    tokio::spawn(log_presence(presence));

    let app_state: AppState = Arc::new(AppStateInner {
        sessions,
        started_at: Instant::now(),
    });

    let auth_routes = Router::new()
        .route("/auth/signup", post(auth::signup))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/google", post(auth::google))
        .route("/auth/apple", post(auth::apple))
        .route(
            "/auth/me",
            get(auth::me).layer(middleware::from_fn_with_state(app_state.clone(), require_auth)),
        )
        .with_state(app_state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .nest("/api/v1", auth_routes)
        .route("/health", get(auth::health).with_state(app_state))
        .merge(ws_route)
        .layer(cors_layer(config.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    info!("Murmur server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// The handshake is authenticated before the upgrade completes; a bad token
/// gets a plain 401 and never becomes a connection.
async fn ws_upgrade(
    State(gateway): State<ConnectionGateway>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match gateway.authenticate(bearer_token(&headers, query.token.as_deref())) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let session = gateway.accept(identity);
        connection::run(socket, gateway, session).await;
    })
}

fn cors_layer(origins: Option<&[String]>) -> CorsLayer {
    let Some(origins) = origins else {
        return CorsLayer::permissive();
    };

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}

/// Presence changes have no contact-list consumer yet; record them.
async fn log_presence(presence: PresenceRelay) {
    let mut changes = presence.subscribe();
    loop {
        match changes.recv().await {
            Ok(change) => debug!("{} is now {:?}", change.user_id, change.status),
            Err(RecvError::Lagged(n)) => warn!("Presence log lagged by {} changes", n),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM. Tears the registry down first so open
/// WebSocket connections close instead of holding up the graceful shutdown.
async fn shutdown_signal(registry: RoomRegistry) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            },
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }

    registry.shutdown();
}
