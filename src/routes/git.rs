//! Git checkout endpoint.
//!
//! `POST /api/git/checkout` — clone a repository into the sandbox via the
//! blocking execution path, so the clone lands in the same filesystem the
//! sessions see. URL validation is format-only (`INVALID_GIT_URL`); the
//! clone itself runs under the session shell with every value quoted.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, ErrorCode};
use crate::process::ExecuteOptions;
use crate::util::shell_quote;
use crate::AppState;

/// Request body for `POST /api/git/checkout`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    /// Repository URL — `http(s)://`, `git://`, `ssh://`, or scp-style
    /// `git@host:path`.
    pub repo_url: String,
    /// Branch to check out (clone default branch when omitted).
    pub branch: Option<String>,
    /// Clone destination; derived from the repository name when omitted.
    pub target_dir: Option<String>,
    /// Session to run the clone in; the shared `default` session when
    /// omitted.
    pub session_id: Option<String>,
}

/// Format-only URL validation: accepted schemes, no whitespace or null bytes.
fn validate_git_url(url: &str) -> Result<(), Error> {
    let bad = || {
        Error::new(
            ErrorCode::InvalidGitUrl,
            format!("Not a valid git URL: {url:?}"),
        )
    };
    if url.is_empty() || url.len() > 2048 {
        return Err(bad());
    }
    if url.contains('\0') || url.chars().any(char::is_whitespace) {
        return Err(bad());
    }
    let scheme_ok = url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with("git://")
        || url.starts_with("ssh://")
        || (url.starts_with("git@") && url.contains(':'));
    if !scheme_ok {
        return Err(bad());
    }
    Ok(())
}

/// Last path segment of the URL, without a `.git` suffix.
fn repo_name(url: &str) -> String {
    let tail = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or("repo");
    tail.trim_end_matches(".git").to_string()
}

/// `POST /api/git/checkout` — clone a repository.
pub async fn checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<Value>, Error> {
    validate_git_url(&payload.repo_url)?;

    let target_dir = payload
        .target_dir
        .clone()
        .unwrap_or_else(|| repo_name(&payload.repo_url));

    let mut command = format!("git clone {}", shell_quote(&payload.repo_url));
    if let Some(ref branch) = payload.branch {
        command.push_str(&format!(" --branch {}", shell_quote(branch)));
    }
    command.push_str(&format!(" {}", shell_quote(&target_dir)));

    let outcome = state
        .process_service
        .execute_command(
            &command,
            ExecuteOptions {
                session_id: payload.session_id,
                cwd: None,
                timeout_ms: None,
            },
        )
        .await?;

    Ok(Json(json!({
        "success": outcome.success,
        "repoUrl": payload.repo_url,
        "branch": payload.branch,
        "targetDir": target_dir,
        "exitCode": outcome.exit_code,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
    })))
}
