//! Watch-party relay.
//!
//! A room-keyed pub/sub broker: it fans playback commands and chat out to the
//! other members of a room and announces new members. It keeps no playback
//! state of its own.

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub mod protocol;
pub mod state;

use protocol::{Message, RoomSummary};
use state::ServerState;

type ClientSender = mpsc::UnboundedSender<Message>;
type ClientSenders = Arc<RwLock<HashMap<Uuid, ClientSender>>>;

#[derive(Clone, Default)]
pub struct AppState {
    server_state: ServerState,
    client_senders: ClientSenders,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Build the relay's HTTP router
pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/rooms", get(list_rooms))
        .route("/ws", get(ws_endpoint))
        .with_state(app_state)
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.server_state.room_summaries().await)
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let server_state = state.server_state.clone();
    let client_senders = state.client_senders.clone();
    let client_id = Uuid::new_v4();
    server_state.add_client(client_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    client_senders.write().await.insert(client_id, tx.clone());

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                if let Err(e) =
                    handle_message(&text, client_id, &server_state, &client_senders).await
                {
                    tracing::warn!("Error handling message from {}: {}", client_id, e);
                    let _ = tx.send(Message::Error {
                        message: e.to_string(),
                    });
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", client_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    client_senders.write().await.remove(&client_id);
    if let Some(room_id) = server_state.remove_client(client_id).await {
        broadcast_member_count(&server_state, &client_senders, &room_id).await;
    }
    send_task.abort();
}

async fn handle_message(
    text: &str,
    client_id: Uuid,
    state: &ServerState,
    client_senders: &ClientSenders,
) -> anyhow::Result<()> {
    let msg: Message = serde_json::from_str(text)?;

    match msg {
        Message::JoinRoom { room_id } => {
            let outcome = state
                .join_room(client_id, &room_id)
                .await
                .map_err(anyhow::Error::msg)?;
            let room_id = room_id.trim().to_string();

            if let Some(previous) = &outcome.previous_room {
                broadcast_member_count(state, client_senders, previous).await;
            }

            let senders = client_senders.read().await;
            if let Some(tx) = senders.get(&client_id) {
                let _ = tx.send(Message::RoomJoined {
                    room_id: room_id.clone(),
                    client_id,
                    members: outcome.members,
                });
            }
            for member_id in &outcome.existing_members {
                if let Some(tx) = senders.get(member_id) {
                    let _ = tx.send(Message::UserJoined {
                        room_id: room_id.clone(),
                        client_id,
                    });
                }
            }
            drop(senders);

            broadcast_member_count(state, client_senders, &room_id).await;
        }

        Message::LeaveRoom => {
            if let Some(room_id) = state.leave_room(client_id).await {
                broadcast_member_count(state, client_senders, &room_id).await;
            }
            if let Some(tx) = client_senders.read().await.get(&client_id) {
                let _ = tx.send(Message::RoomLeft);
            }
        }

        Message::VideoAction { room_id, command } => {
            ensure_member(state, client_id, &room_id)?;
            tracing::debug!("Relaying video action {} in room {}", command, room_id);
            let relayed = Message::ReceiveVideoAction {
                from_client: client_id,
                command,
            };
            broadcast_to_others(state, client_senders, &room_id, client_id, relayed).await;
        }

        Message::SendMessage { room_id, message } => {
            ensure_member(state, client_id, &room_id)?;
            let relayed = Message::ReceiveMessage {
                from_client: client_id,
                message,
            };
            broadcast_to_others(state, client_senders, &room_id, client_id, relayed).await;
        }

        _ => {
            tracing::warn!("Unexpected message from client: {:?}", msg);
        }
    }

    Ok(())
}

fn ensure_member(state: &ServerState, client_id: Uuid, room_id: &str) -> anyhow::Result<()> {
    match state.room_of(client_id) {
        Some(current) if current == room_id.trim() => Ok(()),
        _ => anyhow::bail!("Not a member of room {}", room_id),
    }
}

async fn broadcast_to_others(
    state: &ServerState,
    client_senders: &ClientSenders,
    room_id: &str,
    from_client: Uuid,
    msg: Message,
) {
    let members = state.get_room_members(room_id.trim()).await;
    let senders = client_senders.read().await;

    tracing::debug!(
        "Fanning out from {} to {} other members of room {}",
        from_client,
        members.len().saturating_sub(1),
        room_id
    );

    for member_id in members.into_iter().filter(|id| *id != from_client) {
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(msg.clone());
        }
    }
}

async fn broadcast_member_count(
    state: &ServerState,
    client_senders: &ClientSenders,
    room_id: &str,
) {
    let members = state.get_room_members(room_id).await;
    let count = members.len();
    if count == 0 {
        return;
    }
    let senders = client_senders.read().await;
    for member_id in members {
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(Message::RoomMemberUpdate {
                room_id: room_id.to_string(),
                members: count,
            });
        }
    }
}
