//! Background process endpoints.
//!
//! - `POST   /api/process/start`        — start a tracked background process
//! - `GET    /api/process/list?status=` — list records, optionally filtered
//! - `GET    /api/process/{id}`         — one record
//! - `DELETE /api/process/{id}`         — kill a process
//! - `GET    /api/process/{id}/logs`    — buffered output snapshot
//! - `GET    /api/process/{id}/stream`  — live log stream as SSE
//! - `DELETE /api/process/kill-all`     — kill every live process

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, ErrorCode};
use crate::process::{ExecuteOptions, ProcessStatus};
use crate::AppState;

/// Request body for `POST /api/process/start`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessRequest {
    pub command: String,
    /// Target session; the shared `default` session when omitted.
    pub session_id: Option<String>,
    /// Working directory override for the command.
    pub cwd: Option<String>,
}

/// `POST /api/process/start` — start a background process and return its
/// record once it is tracked (and therefore killable).
pub async fn start_process(
    State(state): State<AppState>,
    Json(payload): Json<StartProcessRequest>,
) -> Result<Json<Value>, Error> {
    let process = state
        .process_service
        .start_process(
            &payload.command,
            ExecuteOptions {
                session_id: payload.session_id,
                cwd: payload.cwd,
                timeout_ms: None,
            },
        )
        .await?;
    let value = serde_json::to_value(&process)
        .map_err(|e| Error::internal(format!("Failed to serialize process: {e}")))?;
    Ok(Json(value))
}

/// Query parameters for `GET /api/process/list`.
#[derive(Deserialize)]
pub struct ListQuery {
    /// Filter on status equality (`running`, `completed`, …).
    pub status: Option<String>,
}

/// `GET /api/process/list` — all process records.
pub async fn list_processes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, Error> {
    let filter = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<ProcessStatus>().map_err(|()| {
            Error::new(
                ErrorCode::InvalidCommand,
                format!("Unknown process status filter: {raw:?}"),
            )
        })?),
    };
    let processes = state.process_service.list_processes(filter);
    Ok(Json(json!({ "processes": processes })))
}

/// `GET /api/process/{id}` — one process record.
pub async fn get_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let process = state.process_service.get_process(&id)?;
    let value = serde_json::to_value(&process)
        .map_err(|e| Error::internal(format!("Failed to serialize process: {e}")))?;
    Ok(Json(value))
}

/// `DELETE /api/process/{id}` — kill a background process. A process that
/// has already finished is a success no-op.
pub async fn kill_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    state.process_service.kill_process(&id).await?;
    Ok(Json(json!({ "ok": true, "id": id })))
}

/// `GET /api/process/{id}/logs` — buffered stdout/stderr snapshot.
pub async fn process_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let (stdout, stderr) = state.process_service.process_logs(&id)?;
    Ok(Json(json!({
        "processId": id,
        "stdout": stdout,
        "stderr": stderr,
    })))
}

/// `GET /api/process/{id}/stream` — restartable log stream as SSE.
///
/// Replays the already-buffered output first, then forwards live chunks, and
/// ends on the process's first terminal status.
pub async fn stream_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let rx = state.process_service.stream_process_logs(&id)?;

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let chunk = rx.recv().await?;
        let data = serde_json::to_string(&chunk).unwrap_or_default();
        Some((Ok::<_, Infallible>(Event::default().data(data)), rx))
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}

/// `DELETE /api/process/kill-all` — kill every non-terminal process.
pub async fn kill_all(State(state): State<AppState>) -> Result<Json<Value>, Error> {
    let killed = state.process_service.kill_all_processes().await;
    Ok(Json(json!({ "ok": true, "killed": killed })))
}
