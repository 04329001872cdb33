//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::ports::PortRegistry;
use crate::process::ProcessService;
use crate::sessions::SessionManager;

/// Shared application state for the sandboxd server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Registry of persistent shell sessions.
    pub session_manager: SessionManager,
    /// Sandbox-wide background process façade.
    pub process_service: ProcessService,
    /// Exposed ports and reverse-proxy forwarding.
    pub port_registry: PortRegistry,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let session_manager = SessionManager::new(Arc::clone(&config));
        let process_service = ProcessService::new(session_manager.clone());
        let port_registry = PortRegistry::new(config.control_port());
        Self {
            config,
            start_time: Instant::now(),
            session_manager,
            process_service,
            port_registry,
        }
    }
}
