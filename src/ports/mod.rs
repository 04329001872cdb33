//! Exposed-port registry and localhost reverse proxy.
//!
//! Services running inside the sandbox bind localhost ports; exposing a port
//! registers it here so `/proxy/{port}/…` requests are forwarded to
//! `http://127.0.0.1:{port}/…` with method, headers, and body passed through
//! verbatim and the response streamed back.
//!
//! The control-plane port (the one this server listens on) is unconditionally
//! reserved and can never be exposed. An entry flips to `inactive` when a
//! proxy attempt fails upstream and back to `active` on the next success;
//! the periodic sweep drops entries that have been inactive for longer than
//! the configured threshold.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::HOST;
use axum::http::Uri;
use axum::response::Response;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorCode};
use crate::util::now_ms;

/// Exposure state of a registered port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Active,
    Inactive,
}

/// Wire-format view of one exposed port.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedPort {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Epoch milliseconds when the port was exposed.
    pub exposed_at: u64,
    pub status: PortStatus,
}

struct Entry {
    name: Option<String>,
    exposed_at: u64,
    status: PortStatus,
    /// Set while `status == Inactive`, for the age-based sweep.
    inactive_since: Option<Instant>,
}

/// Registry of exposed ports with reverse-proxy forwarding.
///
/// Cloneable — clones share the same map and HTTP client.
#[derive(Clone)]
pub struct PortRegistry {
    ports: Arc<RwLock<HashMap<u16, Entry>>>,
    control_port: u16,
    client: Client<HttpConnector, Body>,
}

impl PortRegistry {
    #[must_use]
    pub fn new(control_port: u16) -> Self {
        Self {
            ports: Arc::new(RwLock::new(HashMap::new())),
            control_port,
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    /// Register a port for proxying.
    ///
    /// Rejects port 0 and the control-plane port with `INVALID_PORT`, and
    /// ports that are already exposed with `PORT_ALREADY_EXPOSED`.
    pub async fn expose(&self, port: u16, name: Option<String>) -> Result<ExposedPort, Error> {
        if port == 0 {
            return Err(Error::new(ErrorCode::InvalidPort, "Port must be non-zero"));
        }
        if port == self.control_port {
            return Err(Error::new(
                ErrorCode::InvalidPort,
                format!("Port {port} is the control plane and cannot be exposed"),
            ));
        }
        let mut ports = self.ports.write().await;
        if ports.contains_key(&port) {
            return Err(Error::new(
                ErrorCode::PortAlreadyExposed,
                format!("Port {port} is already exposed"),
            ));
        }
        let entry = Entry {
            name,
            exposed_at: now_ms(),
            status: PortStatus::Active,
            inactive_since: None,
        };
        let view = view(port, &entry);
        ports.insert(port, entry);
        info!("Port {port} exposed");
        Ok(view)
    }

    /// Remove a port. `PORT_NOT_EXPOSED` when it isn't registered.
    pub async fn unexpose(&self, port: u16) -> Result<(), Error> {
        if self.ports.write().await.remove(&port).is_none() {
            return Err(Error::new(
                ErrorCode::PortNotExposed,
                format!("Port {port} is not exposed"),
            ));
        }
        info!("Port {port} unexposed");
        Ok(())
    }

    /// All exposed ports, sorted by port number.
    pub async fn list(&self) -> Vec<ExposedPort> {
        let ports = self.ports.read().await;
        let mut items: Vec<ExposedPort> = ports.iter().map(|(p, e)| view(*p, e)).collect();
        items.sort_by_key(|p| p.port);
        items
    }

    /// Forward a request to `http://127.0.0.1:{port}/{tail}` and stream the
    /// response back. `tail` is the path after the `/proxy/{port}/` prefix;
    /// the original query string, method, headers, and body pass through
    /// verbatim.
    pub async fn proxy(&self, port: u16, tail: &str, mut req: Request) -> Result<Response, Error> {
        if !self.ports.read().await.contains_key(&port) {
            return Err(Error::new(
                ErrorCode::PortNotExposed,
                format!("Port {port} is not exposed"),
            ));
        }

        let path_and_query = match req.uri().query() {
            Some(query) => format!("/{tail}?{query}"),
            None => format!("/{tail}"),
        };
        let uri: Uri = format!("http://127.0.0.1:{port}{path_and_query}")
            .parse()
            .map_err(|e| Error::internal(format!("Failed to build upstream URI: {e}")))?;
        *req.uri_mut() = uri;
        // The inbound Host names this server; the client derives the right
        // one from the rewritten URI.
        req.headers_mut().remove(HOST);

        match self.client.request(req).await {
            Ok(response) => {
                self.mark(port, PortStatus::Active).await;
                Ok(response.map(Body::new))
            }
            Err(e) => {
                warn!("Proxy to port {port} failed: {e}");
                self.mark(port, PortStatus::Inactive).await;
                Err(Error::new(
                    ErrorCode::ProxyUpstreamFailed,
                    format!("Upstream on port {port} is unreachable"),
                ))
            }
        }
    }

    async fn mark(&self, port: u16, status: PortStatus) {
        let mut ports = self.ports.write().await;
        if let Some(entry) = ports.get_mut(&port) {
            if entry.status != status {
                debug!("Port {port} is now {status:?}");
            }
            entry.status = status;
            entry.inactive_since = match status {
                PortStatus::Active => None,
                PortStatus::Inactive => entry.inactive_since.or_else(|| Some(Instant::now())),
            };
        }
    }

    /// Drop entries that have been inactive for longer than `max_inactive`.
    /// Returns how many were removed.
    pub async fn cleanup(&self, max_inactive: Duration) -> usize {
        let mut ports = self.ports.write().await;
        let before = ports.len();
        ports.retain(|_, entry| {
            entry.status == PortStatus::Active
                || entry
                    .inactive_since
                    .is_none_or(|since| since.elapsed() <= max_inactive)
        });
        let removed = before - ports.len();
        if removed > 0 {
            info!("Port GC removed {removed} inactive port(s)");
        }
        removed
    }
}

fn view(port: u16, entry: &Entry) -> ExposedPort {
    ExposedPort {
        port,
        name: entry.name.clone(),
        exposed_at: entry.exposed_at,
        status: entry.status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;

    const CONTROL_PORT: u16 = 3000;

    #[tokio::test]
    async fn control_plane_port_is_reserved() {
        let registry = PortRegistry::new(CONTROL_PORT);
        let err = registry
            .expose(CONTROL_PORT, Some("srv".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPort);

        let err = registry.expose(0, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPort);
    }

    #[tokio::test]
    async fn expose_rejects_duplicates() {
        let registry = PortRegistry::new(CONTROL_PORT);
        registry.expose(8081, None).await.unwrap();
        let err = registry.expose(8081, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PortAlreadyExposed);
    }

    #[tokio::test]
    async fn expose_unexpose_round_trip() {
        let registry = PortRegistry::new(CONTROL_PORT);
        registry
            .expose(8082, Some("web".to_string()))
            .await
            .unwrap();

        let listed = registry.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].port, 8082);
        assert_eq!(listed[0].name.as_deref(), Some("web"));
        assert_eq!(listed[0].status, PortStatus::Active);

        registry.unexpose(8082).await.unwrap();
        assert!(registry.list().await.is_empty());

        let err = registry.unexpose(8082).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PortNotExposed);
    }

    #[tokio::test]
    async fn proxy_forwards_to_local_service() {
        // Tiny upstream on an ephemeral port.
        let app = Router::new().route("/health", get(|| async { r#"{"ok":true}"# }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let registry = PortRegistry::new(CONTROL_PORT);
        registry.expose(port, Some("srv".to_string())).await.unwrap();

        let req = Request::builder()
            .uri(format!("/proxy/{port}/health"))
            .body(Body::empty())
            .unwrap();
        let response = registry.proxy(port, "health", req).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn proxy_to_unknown_port_is_not_found() {
        let registry = PortRegistry::new(CONTROL_PORT);
        let req = Request::builder().body(Body::empty()).unwrap();
        let err = registry.proxy(9999, "x", req).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PortNotExposed);
    }

    #[tokio::test]
    async fn failed_upstream_marks_port_inactive() {
        let registry = PortRegistry::new(CONTROL_PORT);
        // Grab a free port and close it again so nothing is listening.
        let dead_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        registry.expose(dead_port, None).await.unwrap();

        let req = Request::builder().body(Body::empty()).unwrap();
        let err = registry.proxy(dead_port, "x", req).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ProxyUpstreamFailed);

        let listed = registry.list().await;
        assert_eq!(listed[0].status, PortStatus::Inactive);
    }

    #[tokio::test]
    async fn cleanup_only_drops_stale_inactive_entries() {
        let registry = PortRegistry::new(CONTROL_PORT);
        registry.expose(8083, None).await.unwrap();
        registry.expose(8084, None).await.unwrap();
        registry.mark(8084, PortStatus::Inactive).await;

        // Nothing stale yet.
        assert_eq!(registry.cleanup(Duration::from_secs(3600)).await, 0);
        // Zero threshold: the inactive entry is immediately stale.
        assert_eq!(registry.cleanup(Duration::ZERO).await, 1);

        let listed = registry.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].port, 8083);
    }
}
