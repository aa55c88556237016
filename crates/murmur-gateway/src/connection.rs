use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use murmur_types::events::{ClientEvent, ServerEvent};
use murmur_types::models::Identity;

use crate::channel::ChannelName;
use crate::gateway::{ConnectionGateway, Session};
use crate::registry::ConnectionId;

/// Server sends a Ping every 15 seconds. Two missed Pongs in a row (~30s)
/// drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u8 = 2;

/// Drive an accepted connection until either side goes away.
///
/// Inbound events are handled one at a time, in arrival order. Cleanup runs
/// when `session` is dropped at the end of this function, or earlier if the
/// future itself is dropped.
pub async fn run(socket: WebSocket, gateway: ConnectionGateway, session: Session) {
    let Session {
        conn_id,
        identity,
        outbound,
        guard,
    } = session;
    let (sender, receiver) = socket.split();

    let pong_received = Arc::new(AtomicBool::new(true));

    let mut send_task = tokio::spawn(send_loop(sender, outbound, pong_received.clone()));

    let recv_identity = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        recv_loop(receiver, &gateway, conn_id, &recv_identity, &pong_received).await;
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    drop(guard);
    info!(
        "{} ({}) disconnected from gateway",
        identity.username, identity.user_id
    );
}

async fn send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerEvent>,
    pong_received: Arc<AtomicBool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed: u8 = 0;

    loop {
        tokio::select! {
            event = outbound.recv() => {
                // Queue closed: the registry dropped this connection.
                let Some(event) = event else { break };

                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize outbound event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= MAX_MISSED_PONGS {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed);
                        break;
                    }
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

async fn recv_loop(
    mut receiver: SplitStream<WebSocket>,
    gateway: &ConnectionGateway,
    conn_id: ConnectionId,
    identity: &Identity,
    pong_received: &AtomicBool,
) {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => handle_text(gateway, conn_id, identity, text.as_str()).await,
            Message::Pong(_) => pong_received.store(true, Ordering::Release),
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Parse one text frame and act on it. Unparseable frames are answered with
/// an `error` event and otherwise ignored.
pub async fn handle_text(
    gateway: &ConnectionGateway,
    conn_id: ConnectionId,
    identity: &Identity,
    text: &str,
) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => handle_event(gateway, conn_id, identity, event).await,
        Err(e) => {
            warn!(
                "{} ({}) bad event: {}",
                identity.username,
                identity.user_id,
                describe_bad_frame(text, &e)
            );
            gateway
                .registry()
                .send_to(conn_id, ServerEvent::error("Invalid event"));
        }
    }
}

/// Frames may carry message bodies, and serde's own messages can quote the
/// offending value, so only the shape of the failure is reported.
fn describe_bad_frame(text: &str, err: &serde_json::Error) -> String {
    format!(
        "{:?} error at line {} column {} ({} bytes)",
        err.classify(),
        err.line(),
        err.column(),
        text.len()
    )
}

pub async fn handle_event(
    gateway: &ConnectionGateway,
    conn_id: ConnectionId,
    identity: &Identity,
    event: ClientEvent,
) {
    let registry = gateway.registry();

    match event {
        ClientEvent::JoinConversation(conversation_id) => {
            if registry.join(conn_id, ChannelName::conversation(conversation_id)) {
                debug!("{} joined conversation {}", identity.username, conversation_id);
            }
        }

        ClientEvent::LeaveConversation(conversation_id) => {
            if registry.leave(conn_id, &ChannelName::conversation(conversation_id)) {
                debug!("{} left conversation {}", identity.username, conversation_id);
            }
        }

        ClientEvent::SendMessage(msg) => {
            if let Err(e) = gateway.router().send_message(identity, msg).await {
                warn!("{} ({}) send_message failed: {}", identity.username, identity.user_id, e);
                registry.send_to(conn_id, ServerEvent::error(e.client_message()));
            }
        }

        ClientEvent::TypingStart(target) => {
            gateway.router().emit_typing(identity.user_id, &target, true);
        }

        ClientEvent::TypingStop(target) => {
            gateway.router().emit_typing(identity.user_id, &target, false);
        }

        ClientEvent::MessageRead(read) => {
            gateway.router().emit_read_receipt(identity.user_id, &read);
        }

        ClientEvent::UpdateStatus(status) => {
            gateway.presence().update_status(identity.user_id, status);
        }
    }
}
