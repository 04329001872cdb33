//! Crate-wide error taxonomy.
//!
//! Every fallible core operation returns [`Error`], which carries a stable
//! machine-readable [`ErrorCode`], a human-readable message, and optional
//! structured details. Route handlers return `Result<_, Error>` directly —
//! the [`IntoResponse`] impl renders the JSON error body and picks the HTTP
//! status from the code, so the mapping lives in exactly one place.
//!
//! Cleanup-path failures (best-effort file removal, signals to already-dead
//! processes) are logged and swallowed, never surfaced through this type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::util::now_ms;

/// Stable error codes exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation — raised at the boundary, never inside core components.
    InvalidCommand,
    InvalidPort,
    InvalidPath,
    InvalidGitUrl,
    // Resource
    SessionNotFound,
    SessionAlreadyExists,
    SessionNotReady,
    SessionDead,
    CommandNotFound,
    ProcessNotFound,
    PortNotExposed,
    PortAlreadyExposed,
    // Execution
    CommandTimeout,
    OutputTooLarge,
    ShellSpawnFailed,
    FifoInitFailed,
    // Upstream
    ProxyUpstreamFailed,
    // Internal
    Internal,
}

impl ErrorCode {
    /// Wire name of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCommand => "INVALID_COMMAND",
            Self::InvalidPort => "INVALID_PORT",
            Self::InvalidPath => "INVALID_PATH",
            Self::InvalidGitUrl => "INVALID_GIT_URL",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionAlreadyExists => "SESSION_ALREADY_EXISTS",
            Self::SessionNotReady => "SESSION_NOT_READY",
            Self::SessionDead => "SESSION_DEAD",
            Self::CommandNotFound => "COMMAND_NOT_FOUND",
            Self::ProcessNotFound => "PROCESS_NOT_FOUND",
            Self::PortNotExposed => "PORT_NOT_EXPOSED",
            Self::PortAlreadyExposed => "PORT_ALREADY_EXPOSED",
            Self::CommandTimeout => "COMMAND_TIMEOUT",
            Self::OutputTooLarge => "OUTPUT_TOO_LARGE",
            Self::ShellSpawnFailed => "SHELL_SPAWN_FAILED",
            Self::FifoInitFailed => "FIFO_INIT_FAILED",
            Self::ProxyUpstreamFailed => "PROXY_UPSTREAM_FAILED",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status the code maps to.
    #[must_use]
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::InvalidCommand | Self::InvalidPort | Self::InvalidPath | Self::InvalidGitUrl => {
                StatusCode::BAD_REQUEST
            }
            Self::SessionNotFound
            | Self::CommandNotFound
            | Self::ProcessNotFound
            | Self::PortNotExposed => StatusCode::NOT_FOUND,
            Self::SessionAlreadyExists | Self::PortAlreadyExposed => StatusCode::CONFLICT,
            Self::CommandTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::SessionNotReady | Self::SessionDead => StatusCode::SERVICE_UNAVAILABLE,
            Self::OutputTooLarge | Self::ShellSpawnFailed | Self::FifoInitFailed | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ProxyUpstreamFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Optional remediation hint included in the error body.
    fn suggestion(self) -> Option<&'static str> {
        match self {
            Self::CommandTimeout => {
                Some("Increase timeoutMs, or run the command in the background and poll it")
            }
            Self::OutputTooLarge => {
                Some("Redirect output to a file, or raise MAX_OUTPUT_SIZE_BYTES")
            }
            Self::SessionDead => Some("Delete the session and create a new one"),
            Self::PortAlreadyExposed => Some("Unexpose the port first, or pick another port"),
            _ => None,
        }
    }
}

/// A typed error: code + message + optional structured details.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl Error {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Shorthand for an [`ErrorCode::Internal`] error wrapping another error's
    /// message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.code.http_status();
        let mut body = json!({
            "code": self.code.as_str(),
            "message": self.message,
            "details": self.details,
            "timestamp": now_ms(),
            "httpStatus": status.as_u16(),
        });
        if let Some(hint) = self.code.suggestion() {
            body["suggestion"] = json!(hint);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorCode::InvalidPort.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::SessionNotFound.http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ErrorCode::PortAlreadyExposed.http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorCode::CommandTimeout.http_status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ErrorCode::ProxyUpstreamFailed.http_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ErrorCode::SessionNotReady.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = Error::new(ErrorCode::CommandNotFound, "no such command");
        assert_eq!(err.to_string(), "COMMAND_NOT_FOUND: no such command");
    }
}
