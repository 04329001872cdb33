//! Liveness endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, and pool sizes. Suitable for
/// load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.session_manager.session_count().await;
    let processes = state.process_service.list_processes(None).len();
    let ports = state.port_registry.list().await.len();

    Json(json!({
        "status": "ok",
        "uptimeSecs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "processes": processes,
        "exposedPorts": ports,
    }))
}
