//! WebSocket entry point for the signaling plane. One socket per participant; incoming JSON frames carry an
//! envelope naming the recipient, outgoing frames are the manager's
//! relayed/peer-left/producer-gone notifications.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{OutgoingMessage, RoomManager};
use crate::model::{Participant, ParticipantId, Role, SessionId};

#[derive(Clone)]
pub struct SignalingApiState {
    pub rooms: Arc<RoomManager>,
}

pub fn router(state: SignalingApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms/:session_id/join", get(join))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct JoinQuery {
    role: RoleParam,
    rejoin_as: Option<Uuid>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum RoleParam {
    Broadcaster,
    Viewer,
}

/// Inbound frame a connected participant sends to address another peer.
#[derive(Deserialize)]
struct Envelope {
    to: Uuid,
    payload: serde_json::Value,
}

async fn join(
    ws: WebSocketUpgrade,
    State(state): State<SignalingApiState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<JoinQuery>,
) -> Response {
    let session_id = SessionId(session_id);
    let role = match query.role {
        RoleParam::Broadcaster => Role::Broadcaster,
        RoleParam::Viewer => Role::Viewer,
    };
    let rejoin_as = query.rejoin_as.map(ParticipantId);

    match state.rooms.join(session_id, role, rejoin_as) {
        Ok((participant_id, existing, outbox)) => ws.on_upgrade(move |socket| async move {
            info!(%session_id, %participant_id, "signaling participant connected");
            handle_socket(socket, state.rooms, session_id, participant_id, existing, outbox).await;
            info!(%session_id, %participant_id, "signaling participant disconnected");
        }),
        Err(err) => {
            use axum::response::IntoResponse;
            (axum::http::StatusCode::CONFLICT, err.to_string()).into_response()
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    rooms: Arc<RoomManager>,
    session_id: SessionId,
    participant_id: ParticipantId,
    existing: Vec<Participant>,
    mut outbox: tokio::sync::mpsc::Receiver<OutgoingMessage>,
) {
    let (mut sender, mut receiver) = socket.split();

    let ack = serde_json::json!({ "type": "joined", "participant_id": participant_id.0 }).to_string();
    if sender.send(Message::Text(ack)).await.is_err() {
        rooms.leave(session_id, participant_id).await;
        return;
    }

    let participants = serde_json::json!({
        "type": "participants",
        "participants": existing.iter().map(|p| serde_json::json!({ "id": p.id.0, "role": p.role })).collect::<Vec<_>>(),
    })
    .to_string();
    if sender.send(Message::Text(participants)).await.is_err() {
        rooms.leave(session_id, participant_id).await;
        return;
    }

    let send_task = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let frame = match message {
                OutgoingMessage::Relayed { from, payload } => {
                    serde_json::json!({ "type": "signal", "from": from.0, "payload": payload })
                }
                OutgoingMessage::PeerLeft { participant_id } => {
                    serde_json::json!({ "type": "peer-left", "participant_id": participant_id.0 })
                }
                OutgoingMessage::ProducerGone => serde_json::json!({ "type": "producer-gone" }),
            };
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => {
                    let to = ParticipantId(envelope.to);
                    if let Err(err) = rooms.relay(session_id, participant_id, to, envelope.payload).await {
                        warn!(%session_id, %participant_id, %err, "relay rejected");
                    }
                }
                Err(err) => warn!(%session_id, %participant_id, %err, "malformed signaling envelope"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    rooms.leave(session_id, participant_id).await;
}
