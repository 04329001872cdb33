//! File read, write, and delete endpoints.
//!
//! - `GET    /api/files?path=...` — read a file
//! - `PUT    /api/files`          — write a file (atomic)
//! - `DELETE /api/files`          — delete a file
//!
//! ## Path validation
//!
//! Format-only: paths are rejected for null bytes or length over 4096.
//! There is no allowlist — the sandbox trusts container isolation. Relative
//! paths resolve against the configured workspace directory.
//!
//! ## Size limits
//!
//! Reads and writes are capped at `server.max_file_size`. Binary content is
//! returned/accepted base64-encoded.
//!
//! ## Atomicity
//!
//! Writes go to a temp file in the target directory followed by a rename, so
//! readers never observe a partially-written file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::{Query, State};
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, ErrorCode};
use crate::AppState;

/// Longest accepted path, matching the common `PATH_MAX`.
const MAX_PATH_LEN: usize = 4096;

/// Monotonic counter to uniquify temp file names across concurrent writes.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Format-only path validation: null bytes and length. Relative paths are
/// resolved against the workspace.
fn validate_path(path: &str, workspace: &str) -> Result<PathBuf, Error> {
    if path.is_empty() {
        return Err(Error::new(ErrorCode::InvalidPath, "Path must not be empty"));
    }
    if path.contains('\0') {
        return Err(Error::new(
            ErrorCode::InvalidPath,
            "Path must not contain null bytes",
        ));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(Error::new(
            ErrorCode::InvalidPath,
            format!("Path exceeds {MAX_PATH_LEN} bytes"),
        ));
    }
    let p = PathBuf::from(path);
    if p.is_absolute() {
        Ok(p)
    } else {
        Ok(PathBuf::from(workspace).join(p))
    }
}

fn io_error(path: &std::path::Path, e: &std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::NotFound => Error::new(
            ErrorCode::InvalidPath,
            format!("{}: no such file", path.display()),
        ),
        _ => Error::internal(format!("{}: {e}", path.display())),
    }
}

/// Query parameters for `GET /api/files`.
#[derive(Deserialize)]
pub struct ReadQuery {
    pub path: String,
}

/// `GET /api/files` — read a file. UTF-8 text comes back verbatim; binary
/// content is base64-encoded with `"encoding": "base64"`.
pub async fn read_file(
    State(state): State<AppState>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<Value>, Error> {
    let path = validate_path(&query.path, &state.config.shell.default_working_dir)?;

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| io_error(&path, &e))?;
    if metadata.is_dir() {
        return Err(Error::new(
            ErrorCode::InvalidPath,
            format!("{} is a directory", path.display()),
        ));
    }
    let max = state.config.server.max_file_size as u64;
    if metadata.len() > max {
        return Err(Error::new(
            ErrorCode::OutputTooLarge,
            format!("File is {} bytes, max {max}", metadata.len()),
        ));
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| io_error(&path, &e))?;
    let mut body = json!({
        "path": path.to_string_lossy(),
        "size": metadata.len(),
    });
    match String::from_utf8(bytes) {
        Ok(text) => body["content"] = json!(text),
        Err(e) => {
            body["content"] = json!(base64::engine::general_purpose::STANDARD.encode(e.as_bytes()));
            body["encoding"] = json!("base64");
        }
    }
    Ok(Json(body))
}

/// Request body for `PUT /api/files`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub path: String,
    /// File contents — UTF-8 text, or base64 when `encoding` is `"base64"`.
    pub content: String,
    /// Set to `"base64"` for binary content.
    pub encoding: Option<String>,
    /// Create parent directories if they don't exist.
    #[serde(default)]
    pub create_dirs: bool,
}

/// `PUT /api/files` — write a file atomically (temp file + rename).
pub async fn write_file(
    State(state): State<AppState>,
    Json(payload): Json<WriteRequest>,
) -> Result<Json<Value>, Error> {
    let path = validate_path(&payload.path, &state.config.shell.default_working_dir)?;

    let bytes = match payload.encoding.as_deref() {
        Some("base64") => base64::engine::general_purpose::STANDARD
            .decode(&payload.content)
            .map_err(|e| Error::new(ErrorCode::InvalidPath, format!("Invalid base64: {e}")))?,
        _ => payload.content.into_bytes(),
    };
    if bytes.len() > state.config.server.max_file_size {
        return Err(Error::new(
            ErrorCode::OutputTooLarge,
            format!(
                "Content is {} bytes, max {}",
                bytes.len(),
                state.config.server.max_file_size
            ),
        ));
    }

    let parent = path
        .parent()
        .ok_or_else(|| Error::new(ErrorCode::InvalidPath, "Path has no parent directory"))?;
    if payload.create_dirs {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, &e))?;
    }

    let tmp = parent.join(format!(
        ".sandboxd-write-{}-{}",
        std::process::id(),
        WRITE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| io_error(&tmp, &e))?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error(&path, &e));
    }

    Ok(Json(json!({
        "ok": true,
        "path": path.to_string_lossy(),
        "size": bytes.len(),
    })))
}

/// Request body for `DELETE /api/files`.
#[derive(Deserialize)]
pub struct DeleteRequest {
    pub path: String,
}

/// `DELETE /api/files` — delete a file.
pub async fn delete_file(
    State(state): State<AppState>,
    Json(payload): Json<DeleteRequest>,
) -> Result<Json<Value>, Error> {
    let path = validate_path(&payload.path, &state.config.shell.default_working_dir)?;
    tokio::fs::remove_file(&path)
        .await
        .map_err(|e| io_error(&path, &e))?;
    Ok(Json(json!({ "ok": true, "path": path.to_string_lossy() })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_is_format_only() {
        // Traversal and shell metacharacters are fine — format only.
        assert!(validate_path("/a/../b", "/workspace").is_ok());
        assert!(validate_path("/tmp/$(x)", "/workspace").is_ok());

        assert_eq!(
            validate_path("bad\0path", "/workspace").unwrap_err().code,
            ErrorCode::InvalidPath
        );
        assert_eq!(
            validate_path("", "/workspace").unwrap_err().code,
            ErrorCode::InvalidPath
        );
        let long = "/".repeat(MAX_PATH_LEN + 1);
        assert_eq!(
            validate_path(&long, "/workspace").unwrap_err().code,
            ErrorCode::InvalidPath
        );
    }

    #[test]
    fn relative_paths_resolve_against_workspace() {
        let resolved = validate_path("notes.txt", "/workspace").unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/notes.txt"));

        let absolute = validate_path("/etc/hostname", "/workspace").unwrap();
        assert_eq!(absolute, PathBuf::from("/etc/hostname"));
    }
}
