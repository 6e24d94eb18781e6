//! REST surface for the Session Orchestrator. There is no separate façade process: this router is bound
//! directly to the in-process `Orchestrator`, the same "one axum router
//! per binary" shape used by the Agent and Signaling components.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Orchestrator;
use crate::errors::CosimError;
use crate::model::{EngineKind, OrgId, Resources, Session, SessionId, WorkspaceId};

#[derive(Clone)]
pub struct OrchestratorApiState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: OrchestratorApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).patch(patch_session).delete(delete_session))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct ResourcesRequest {
    cpu: f64,
    mem: u64,
    gpu: u32,
    gpu_class: Option<String>,
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    workspace_id: Uuid,
    org_id: Uuid,
    org_key: String,
    tier: String,
    engine: EngineKind,
    model_ref: String,
    resources: ResourcesRequest,
    idle_seconds: Option<u64>,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: Uuid,
    state: String,
}

/// `POST /sessions` → `{session_id, state}`. Auth (bearer token
/// carrying `{user_id, org_id, tier}`) is out of scope here; the caller
/// is expected to front this router with a `TokenValidator` and populate
/// `org_id`/`org_key`/`tier` from validated claims.
async fn create_session(
    State(state): State<OrchestratorApiState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let resources = Resources {
        cpu_cores: req.resources.cpu,
        memory_bytes: req.resources.mem,
        gpu_count: req.resources.gpu,
        gpu_class: req.resources.gpu_class,
    };
    let session_id = state
        .orchestrator
        .create_session(
            WorkspaceId(req.workspace_id),
            OrgId(req.org_id),
            req.org_key,
            req.tier,
            resources,
            req.engine,
            req.model_ref,
            req.idle_seconds.unwrap_or(300),
        )
        .await?;
    let session_state = state.orchestrator.state_of(session_id)?;
    Ok(Json(CreateSessionResponse { session_id: session_id.0, state: session_state.to_string() }))
}

/// `GET /sessions/{id}` → full session record.
async fn get_session(State(state): State<OrchestratorApiState>, Path(id): Path<Uuid>) -> Result<Json<Session>, ApiError> {
    let session = state.orchestrator.session_snapshot(SessionId(id))?;
    Ok(Json(session))
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum PatchAction {
    Pause,
    Resume,
}

#[derive(Deserialize)]
struct PatchSessionRequest {
    action: PatchAction,
}

/// `PATCH /sessions/{id}` with `{action: pause|resume}`.
/// `resume` is activity: it clears the idle timer and returns the
/// session to `Ready` if it was hibernating. `pause` requests hibernation
/// directly rather than waiting out `idle_hibernate_seconds`.
async fn patch_session(
    State(state): State<OrchestratorApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PatchSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    let session_id = SessionId(id);
    match req.action {
        PatchAction::Resume => state.orchestrator.record_activity(session_id).await,
        PatchAction::Pause => state.orchestrator.request_hibernate(session_id).await,
    }
    let session = state.orchestrator.session_snapshot(session_id)?;
    Ok(Json(session))
}

/// `DELETE /sessions/{id}`.
async fn delete_session(State(state): State<OrchestratorApiState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete_session(SessionId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

struct ApiError(CosimError);

impl From<CosimError> for ApiError {
    fn from(err: CosimError) -> Self {
        ApiError(err)
    }
}

impl From<crate::errors::SessionError> for ApiError {
    fn from(err: crate::errors::SessionError) -> Self {
        ApiError(CosimError::Session(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use crate::errors::SessionError;
        let status = match &self.0 {
            CosimError::Admission(_) => StatusCode::CONFLICT,
            CosimError::Scheduling(_) => StatusCode::SERVICE_UNAVAILABLE,
            CosimError::Session(SessionError::SessionNotFound) => StatusCode::NOT_FOUND,
            CosimError::Session(SessionError::AlreadyExistsDifferent) => StatusCode::CONFLICT,
            CosimError::Session(SessionError::SessionTerminated) => StatusCode::GONE,
            CosimError::Session(SessionError::ModelLoadFailed(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.0)).into_response()
    }
}
