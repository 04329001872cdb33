//! REST endpoints for session management.
//!
//! - `POST   /api/session/create`    — create a session
//! - `GET    /api/session/list`      — list all sessions
//! - `DELETE /api/session/{id}`      — destroy a session
//! - `POST   /api/session/{id}/env`  — export env vars into a session

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Error;
use crate::sessions::CreateSessionOptions;
use crate::AppState;

/// Request body for `POST /api/session/create`.
///
/// All fields are optional — an id is minted and config defaults apply when
/// omitted.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Caller-chosen session id (must be unused).
    pub id: Option<String>,
    /// Extra environment for the session shell.
    pub env: Option<HashMap<String, String>>,
    /// Session working directory.
    pub cwd: Option<String>,
    /// Per-session command timeout override.
    pub command_timeout_ms: Option<u64>,
}

/// `POST /api/session/create` — create a new persistent shell session.
pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<Json<Value>, Error> {
    let session = state
        .session_manager
        .create_session(CreateSessionOptions {
            id: payload.id,
            env: payload.env.unwrap_or_default(),
            cwd: payload.cwd,
            command_timeout_ms: payload.command_timeout_ms,
        })
        .await?;

    Ok(Json(json!({
        "id": session.id(),
        "cwd": session.cwd(),
        "shellPid": session.shell_pid(),
        "createdAt": session.created_at(),
        "ready": session.is_ready(),
    })))
}

/// `GET /api/session/list` — list all sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Value>, Error> {
    let sessions = state.session_manager.list_sessions().await;
    Ok(Json(json!({ "sessions": sessions })))
}

/// `DELETE /api/session/{id}` — destroy a session and remove it.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    state.session_manager.delete_session(&id).await?;
    Ok(Json(json!({ "ok": true, "id": id })))
}

/// Request body for `POST /api/session/{id}/env`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetEnvRequest {
    pub env_vars: HashMap<String, String>,
}

/// `POST /api/session/{id}/env` — export variables into the session shell so
/// they persist for future commands.
pub async fn set_env_vars(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SetEnvRequest>,
) -> Result<Json<Value>, Error> {
    state
        .session_manager
        .set_env_vars(&id, &payload.env_vars)
        .await?;
    Ok(Json(json!({ "ok": true, "id": id })))
}
