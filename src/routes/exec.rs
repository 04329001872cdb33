//! Command execution endpoints.
//!
//! - `POST /api/execute`        — blocking (or `background: true`) execution
//! - `POST /api/execute/stream` — execution streamed as Server-Sent Events
//!
//! Both endpoints run commands inside a persistent session, so `cd`,
//! `export`, and shell functions persist across calls that share a
//! `sessionId`. Requests without one use the shared `default` session.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Error;
use crate::process::ExecuteOptions;
use crate::sessions::ExecEvent;
use crate::AppState;

/// Request body for `POST /api/execute` and `POST /api/execute/stream`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Shell command text, injected into the session shell.
    pub command: String,
    /// Target session; the shared `default` session when omitted.
    pub session_id: Option<String>,
    /// Run as a background process instead of blocking (ignored by the
    /// streaming endpoint).
    #[serde(default)]
    pub background: bool,
    /// Timeout applied when this call creates the session.
    pub timeout_ms: Option<u64>,
    /// Per-command working directory override.
    pub cwd: Option<String>,
}

impl ExecuteRequest {
    fn options(&self) -> ExecuteOptions {
        ExecuteOptions {
            session_id: self.session_id.clone(),
            cwd: self.cwd.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// `POST /api/execute` — run a command.
///
/// Blocking by default, returning `{success, exitCode, stdout, stderr}`.
/// With `background: true` the command becomes a tracked process and the
/// response is its record snapshot.
pub async fn execute(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Json<Value>, Error> {
    if payload.background {
        let process = state
            .process_service
            .start_process(&payload.command, payload.options())
            .await?;
        let value = serde_json::to_value(&process)
            .map_err(|e| Error::internal(format!("Failed to serialize process: {e}")))?;
        return Ok(Json(value));
    }

    let outcome = state
        .process_service
        .execute_command(&payload.command, payload.options())
        .await?;
    let value = serde_json::to_value(&outcome)
        .map_err(|e| Error::internal(format!("Failed to serialize result: {e}")))?;
    Ok(Json(value))
}

/// `POST /api/execute/stream` — run a command, streaming execution events as
/// SSE frames of the form `data: {"type": …}`.
///
/// Initial failures (validation, dead session) surface as a JSON error
/// response before any stream bytes; mid-stream failures arrive as an
/// `error` event.
pub async fn execute_stream(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, Error> {
    let (_, rx) = state
        .process_service
        .execute_command_stream_events(&payload.command, payload.options())
        .await?;

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let data = serde_json::to_string(&event_json(&event)).unwrap_or_default();
        Some((Ok::<_, Infallible>(Event::default().data(data)), rx))
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}

/// Wire shape of one execution event.
pub fn event_json(event: &ExecEvent) -> Value {
    match event {
        ExecEvent::Start {
            command_id,
            timestamp,
        } => json!({
            "type": "start",
            "commandId": command_id,
            "timestamp": timestamp,
        }),
        ExecEvent::Stdout { data } => json!({ "type": "stdout", "data": data }),
        ExecEvent::Stderr { data } => json!({ "type": "stderr", "data": data }),
        ExecEvent::Complete { exit_code, result } => json!({
            "type": "complete",
            "exitCode": exit_code,
            "result": result,
        }),
        ExecEvent::Error { error } => json!({
            "type": "error",
            "error": { "code": error.code.as_str(), "message": error.message },
        }),
    }
}
