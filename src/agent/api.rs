//! REST + WebSocket surface for a Simulation Agent pod: an axum router
//! using the `ws.on_upgrade` + `futures::StreamExt::split` pattern for
//! the frame-streaming WebSocket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{CreateParams, SimulationAgent};
use crate::errors::SessionError;
use crate::model::{ControlCommand, EngineKind, SessionId, StreamItem};

#[derive(Clone)]
pub struct AgentApiState {
    pub agent: Arc<SimulationAgent>,
}

pub fn router(state: AgentApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/simulations/create", post(create_simulation))
        .route("/simulations/:session_id/control", post(control))
        .route("/simulations/:session_id/state", get(get_state))
        .route("/simulations/:session_id", delete(delete_simulation))
        .route("/simulations/:session_id/stream", get(stream))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct CreateSimulationRequest {
    session_id: Uuid,
    generation: u64,
    engine: EngineKind,
    model_ref: String,
    width: u32,
    height: u32,
    fps: u32,
    headless: bool,
}

#[derive(Serialize)]
struct CreateSimulationResponse {
    session_id: Uuid,
}

async fn create_simulation(
    State(state): State<AgentApiState>,
    Json(req): Json<CreateSimulationRequest>,
) -> Result<Json<CreateSimulationResponse>, ApiError> {
    let session_id = SessionId(req.session_id);
    let params = CreateParams {
        engine: req.engine,
        model_ref: req.model_ref,
        width: req.width,
        height: req.height,
        fps: req.fps,
        headless: req.headless,
    };
    state.agent.create_simulation(session_id, req.generation, params)?;
    Ok(Json(CreateSimulationResponse { session_id: session_id.0 }))
}

async fn control(
    State(state): State<AgentApiState>,
    Path(session_id): Path<Uuid>,
    Json(command): Json<ControlCommand>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reply = state.agent.control(SessionId(session_id), command).await?;
    let body = match reply {
        super::ControlReply::State(state) => serde_json::json!({ "state": state }),
        super::ControlReply::Executed(result) => serde_json::json!({
            "status": format!("{:?}", result.status),
            "stdout": String::from_utf8_lossy(&result.stdout),
            "error": result.error_kind,
            "state": result.final_state,
        }),
        super::ControlReply::Faulted { error, state } => serde_json::json!({ "error": error, "state": state }),
    };
    Ok(Json(body))
}

async fn get_state(
    State(state): State<AgentApiState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<crate::engine::State>, ApiError> {
    let current = state.agent.get_state(SessionId(session_id)).await?;
    Ok(Json(current))
}

async fn delete_simulation(
    State(state): State<AgentApiState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.agent.delete(SessionId(session_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream(
    ws: WebSocketUpgrade,
    State(state): State<AgentApiState>,
    Path(session_id): Path<Uuid>,
) -> Response {
    let session_id = SessionId(session_id);
    match state.agent.subscribe(session_id) {
        Ok(rx) => ws.on_upgrade(move |socket| async move {
            info!(%session_id, "stream subscriber connected");
            handle_stream(socket, rx).await;
            info!(%session_id, "stream subscriber disconnected");
        }),
        Err(_) => (StatusCode::NOT_FOUND, "session not found").into_response(),
    }
}

/// First frame of the socket is always a text marker so a client can
/// distinguish "stream just opened" from "the engine was reset"; frames
/// thereafter are sent as binary.
async fn handle_stream(socket: WebSocket, mut rx: tokio::sync::broadcast::Receiver<StreamItem>) {
    let (mut sender, mut receiver) = socket.split();
    if sender.send(Message::Text("subscribed".into())).await.is_err() {
        return;
    }

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(StreamItem::Reset { generation }) => {
                    let text = serde_json::json!({ "type": "reset", "generation": generation }).to_string();
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(StreamItem::Frame(frame)) => {
                    if sender.send(Message::Binary(frame.bytes)).await.is_err() {
                        break;
                    }
                }
                Ok(StreamItem::Faulted) => {
                    let _ = sender.send(Message::Text("{\"type\":\"faulted\"}".into())).await;
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "stream subscriber lagged; frames may be dropped, never reordered");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
    send_task.abort();
}

struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            SessionError::SessionNotFound => StatusCode::NOT_FOUND,
            SessionError::AlreadyExistsDifferent => StatusCode::CONFLICT,
            SessionError::SessionTerminated => StatusCode::GONE,
            SessionError::ModelLoadFailed(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(self.0)).into_response()
    }
}
