#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! sandboxd library — the in-container sandbox execution service.
//!
//! The building blocks:
//! - `sessions` — persistent shell sessions with labeled-output execution
//! - `process` — sandbox-wide background process records and streaming
//! - `ports` — exposed-port registry and localhost reverse proxy
//! - `routes` — REST/SSE API route handlers
//! - `config` — configuration loading
//! - `error` — the crate-wide error taxonomy

pub mod config;
pub mod error;
pub mod ports;
pub mod process;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{Error, ErrorCode};
pub use ports::PortRegistry;
pub use process::ProcessService;
pub use sessions::SessionManager;
pub use state::AppState;
