//! Exposed-port endpoints and the reverse proxy.
//!
//! - `POST   /api/expose-port`          — register a port for proxying
//! - `GET    /api/exposed-ports`        — list exposed ports
//! - `DELETE /api/exposed-ports/{port}` — unexpose a port
//! - `ANY    /proxy/{port}/{*path}`     — forward to `localhost:{port}`

use axum::extract::{Path, Request, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, ErrorCode};
use crate::AppState;

/// Request body for `POST /api/expose-port`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposePortRequest {
    pub port: u16,
    /// Optional human-readable label.
    pub name: Option<String>,
}

/// `POST /api/expose-port` — register a port.
pub async fn expose_port(
    State(state): State<AppState>,
    Json(payload): Json<ExposePortRequest>,
) -> Result<Json<Value>, Error> {
    let exposed = state
        .port_registry
        .expose(payload.port, payload.name)
        .await?;
    let value = serde_json::to_value(&exposed)
        .map_err(|e| Error::internal(format!("Failed to serialize port: {e}")))?;
    Ok(Json(value))
}

/// `GET /api/exposed-ports` — list exposed ports.
pub async fn list_ports(State(state): State<AppState>) -> Result<Json<Value>, Error> {
    let ports = state.port_registry.list().await;
    Ok(Json(json!({ "ports": ports })))
}

/// `DELETE /api/exposed-ports/{port}` — unexpose a port.
pub async fn unexpose_port(
    State(state): State<AppState>,
    Path(port): Path<String>,
) -> Result<Json<Value>, Error> {
    let port = parse_port(&port)?;
    state.port_registry.unexpose(port).await?;
    Ok(Json(json!({ "ok": true, "port": port })))
}

/// `ANY /proxy/{port}/{*path}` — forward a request to the exposed port.
pub async fn proxy(
    State(state): State<AppState>,
    Path((port, path)): Path<(String, String)>,
    req: Request,
) -> Result<Response, Error> {
    let port = parse_port(&port)?;
    state.port_registry.proxy(port, &path, req).await
}

/// `ANY /proxy/{port}` — forward a request for the upstream root.
pub async fn proxy_root(
    State(state): State<AppState>,
    Path(port): Path<String>,
    req: Request,
) -> Result<Response, Error> {
    let port = parse_port(&port)?;
    state.port_registry.proxy(port, "", req).await
}

fn parse_port(raw: &str) -> Result<u16, Error> {
    raw.parse().map_err(|_| {
        Error::new(
            ErrorCode::InvalidPort,
            format!("Not a valid port number: {raw:?}"),
        )
    })
}
