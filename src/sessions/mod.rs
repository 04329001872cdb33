//! Persistent shell session management.
//!
//! [`SessionManager`] is the single authority for creating, accessing, and
//! destroying sessions. It enforces at-most-one-live-shell per session id and
//! supports:
//!
//! - **Lazy creation** on the execution paths — running a command against an
//!   unknown session id creates the session first. Kill and list operations
//!   never create sessions as a side effect.
//! - **Streaming registration** — `execute_stream_in_session` only returns
//!   after the underlying stream's first event, so a caller can never race a
//!   `kill_command` against command registration.
//! - **Teardown** — `destroy` tears down every session, reporting individual
//!   failures to the log without short-circuiting.
//!
//! ## Concurrency
//!
//! The session map is behind an `RwLock`. Read operations take a read lock;
//! `create_session` holds the write lock across the whole check-initialize-
//! insert sequence to prevent TOCTOU races on the id.

pub mod protocol;
pub mod script;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, ErrorCode};
use crate::util::shell_quote;

pub use session::{ExecEvent, ExecOptions, ExecResult, Session, SessionSettings};

/// Options accepted by [`SessionManager::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Caller-chosen id; a v4 uuid is minted when absent.
    pub id: Option<String>,
    /// Extra environment for the session shell.
    pub env: HashMap<String, String>,
    /// Session working directory; defaults to the configured workspace.
    pub cwd: Option<String>,
    /// Per-session command timeout override.
    pub command_timeout_ms: Option<u64>,
}

/// Summary of a session returned by [`SessionManager::list_sessions`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListItem {
    pub id: String,
    pub shell_pid: u32,
    pub cwd: String,
    pub ready: bool,
    /// Epoch milliseconds when the session was created.
    pub created_at: u64,
    /// Commands currently registered (foreground or background).
    pub active_commands: usize,
}

/// Manages the pool of persistent shell sessions.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    config: Arc<Config>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Create a session. Fails with `SESSION_ALREADY_EXISTS` when the id is
    /// taken. Holds the write lock through initialization so two racing
    /// creates for the same id cannot both spawn a shell.
    pub async fn create_session(
        &self,
        opts: CreateSessionOptions,
    ) -> Result<Arc<Session>, Error> {
        let id = opts.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(Error::new(
                ErrorCode::SessionAlreadyExists,
                format!("Session {id} already exists"),
            ));
        }

        let settings = SessionSettings {
            id: id.clone(),
            shell: self.config.shell.shell.clone(),
            cwd: opts
                .cwd
                .unwrap_or_else(|| self.config.shell.default_working_dir.clone()),
            env: opts.env,
            command_timeout: Duration::from_millis(
                opts.command_timeout_ms
                    .unwrap_or(self.config.server.command_timeout_ms),
            ),
            max_output_bytes: self.config.server.max_output_size_bytes,
        };
        let session = Arc::new(Session::initialize(settings).await?);
        sessions.insert(id.clone(), Arc::clone(&session));
        info!("Session {id} created, total: {}", sessions.len());
        Ok(session)
    }

    /// Look up an existing session.
    pub async fn get_session(&self, id: &str) -> Result<Arc<Session>, Error> {
        self.sessions.read().await.get(id).cloned().ok_or_else(|| {
            Error::new(
                ErrorCode::SessionNotFound,
                format!("Session {id} not found"),
            )
        })
    }

    /// Existing session, or lazily create one. Only the execution paths call
    /// this — kills and listings must not create sessions.
    async fn obtain(
        &self,
        id: &str,
        cwd: Option<&str>,
        command_timeout_ms: Option<u64>,
    ) -> Result<Arc<Session>, Error> {
        if let Some(session) = self.sessions.read().await.get(id).cloned() {
            return Ok(session);
        }
        match self
            .create_session(CreateSessionOptions {
                id: Some(id.to_string()),
                env: HashMap::new(),
                cwd: cwd.map(ToString::to_string),
                command_timeout_ms,
            })
            .await
        {
            Ok(session) => Ok(session),
            // Lost a create race — the winner's session is the live one.
            Err(e) if e.code == ErrorCode::SessionAlreadyExists => self.get_session(id).await,
            Err(e) => Err(e),
        }
    }

    /// Run a blocking command in a session, creating it on demand.
    pub async fn execute_in_session(
        &self,
        id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout_ms: Option<u64>,
    ) -> Result<ExecResult, Error> {
        let session = self.obtain(id, cwd, timeout_ms).await?;
        session
            .exec(
                command,
                ExecOptions {
                    cwd: cwd.map(ToString::to_string),
                    command_id: None,
                },
            )
            .await
    }

    /// Start a streaming command in a session, creating it on demand.
    ///
    /// Awaits the first event of the underlying stream before returning, so
    /// the command is registered — and therefore killable — before any caller
    /// can observe this function's completion. The remaining events are
    /// drained by a spawned task that feeds `on_event`; its handle is
    /// returned for callers that want to await the drain.
    ///
    /// Initial failures (bad session, pipe setup, dead shell) surface as
    /// `Err` here; mid-stream failures are delivered as `Error` events.
    pub async fn execute_stream_in_session<F>(
        &self,
        id: &str,
        command: &str,
        on_event: F,
        cwd: Option<&str>,
        command_id: String,
    ) -> Result<JoinHandle<()>, Error>
    where
        F: Fn(ExecEvent) + Send + Sync + 'static,
    {
        let session = self.obtain(id, cwd, None).await?;
        let mut rx = session
            .exec_stream(
                command,
                ExecOptions {
                    cwd: cwd.map(ToString::to_string),
                    command_id: Some(command_id),
                },
            )
            .await?;

        let Some(first) = rx.recv().await else {
            return Err(Error::internal("Command stream closed before first event"));
        };
        on_event(first);

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                on_event(event);
            }
        });
        Ok(task)
    }

    /// Kill a background command. Never creates a session.
    ///
    /// `COMMAND_NOT_FOUND` when the session exists but the command is unknown
    /// or has already completed.
    pub async fn kill_command(&self, session_id: &str, command_id: &str) -> Result<(), Error> {
        let session = self.get_session(session_id).await?;
        if session.kill_command(command_id).await {
            Ok(())
        } else {
            Err(Error::new(
                ErrorCode::CommandNotFound,
                format!("Command {command_id} not found in session {session_id} (or already completed)"),
            ))
        }
    }

    /// Export environment variables into a session's shell so they persist
    /// for future commands.
    pub async fn set_env_vars(
        &self,
        session_id: &str,
        vars: &HashMap<String, String>,
    ) -> Result<(), Error> {
        let session = self.get_session(session_id).await?;
        for (key, value) in vars {
            if !is_valid_var_name(key) {
                return Err(Error::new(
                    ErrorCode::InvalidCommand,
                    format!("Invalid environment variable name: {key:?}"),
                ));
            }
            let command = format!("export {key}={}", shell_quote(value));
            let result = session.exec(&command, ExecOptions::default()).await?;
            if result.exit_code != 0 {
                return Err(Error::internal(format!(
                    "export {key} failed with exit code {}",
                    result.exit_code
                )));
            }
        }
        Ok(())
    }

    /// Summaries of all sessions.
    pub async fn list_sessions(&self) -> Vec<SessionListItem> {
        let sessions = self.sessions.read().await;
        let mut items = Vec::with_capacity(sessions.len());
        for (id, session) in sessions.iter() {
            items.push(SessionListItem {
                id: id.clone(),
                shell_pid: session.shell_pid(),
                cwd: session.cwd().to_string(),
                ready: session.is_ready(),
                created_at: session.created_at(),
                active_commands: session.active_commands().await,
            });
        }
        items
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Destroy one session and remove it from the pool.
    pub async fn delete_session(&self, id: &str) -> Result<(), Error> {
        let session = self.sessions.write().await.remove(id).ok_or_else(|| {
            Error::new(
                ErrorCode::SessionNotFound,
                format!("Session {id} not found"),
            )
        })?;
        session.destroy().await;
        Ok(())
    }

    /// Destroy all sessions (used during shutdown). Per-session failures are
    /// logged, never propagated.
    pub async fn destroy(&self) {
        let drained: Vec<(String, Arc<Session>)> =
            self.sessions.write().await.drain().collect();
        let count = drained.len();
        for (id, session) in drained {
            session.destroy().await;
            if session.temp_dir().exists() {
                warn!("Session {id}: temp dir survived destroy");
            }
        }
        if count > 0 {
            info!("Destroyed {count} session(s)");
        }
    }
}

/// Shell variable names: `[A-Za-z_][A-Za-z0-9_]*`.
fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn test_config(dir: &std::path::Path) -> Arc<Config> {
        let mut config = Config::default();
        config.shell.default_working_dir = dir.to_string_lossy().into_owned();
        Arc::new(config)
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));

        manager
            .create_session(CreateSessionOptions {
                id: Some("dup".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = manager
            .create_session(CreateSessionOptions {
                id: Some("dup".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionAlreadyExists);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn create_delete_create_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));

        manager
            .create_session(CreateSessionOptions {
                id: Some("cycle".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        manager.delete_session("cycle").await.unwrap();
        manager
            .create_session(CreateSessionOptions {
                id: Some("cycle".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        manager.destroy().await;
    }

    #[tokio::test]
    async fn execute_creates_session_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));

        let result = manager
            .execute_in_session("lazy", "echo hi", None, None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(manager.session_count().await, 1);

        // State persists across calls on the same id.
        manager
            .execute_in_session("lazy", "export Y=ok", None, None)
            .await
            .unwrap();
        let result = manager
            .execute_in_session("lazy", "echo $Y", None, None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "ok\n");
        manager.destroy().await;
    }

    #[tokio::test]
    async fn kill_never_creates_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));

        let err = manager.kill_command("ghost", "cmd").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
        assert_eq!(manager.session_count().await, 0);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn kill_unknown_command_in_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));

        manager
            .create_session(CreateSessionOptions {
                id: Some("live".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = manager.kill_command("live", "nope").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandNotFound);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn set_env_vars_persists_for_future_commands() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));

        manager
            .create_session(CreateSessionOptions {
                id: Some("envs".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut vars = HashMap::new();
        vars.insert("K".to_string(), "it's 42".to_string());
        manager.set_env_vars("envs", &vars).await.unwrap();

        let result = manager
            .execute_in_session("envs", "echo $K", None, None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "it's 42\n");
        assert_eq!(result.exit_code, 0);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn set_env_vars_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));

        manager
            .create_session(CreateSessionOptions {
                id: Some("badenv".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut vars = HashMap::new();
        vars.insert("BAD NAME".to_string(), "x".to_string());
        let err = manager.set_env_vars("badenv", &vars).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCommand);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn stream_command_is_killable_once_started() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));

        let events: Arc<StdMutex<Vec<ExecEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager
            .execute_stream_in_session(
                "streamer",
                "exec sleep 30",
                move |event| sink.lock().unwrap().push(event),
                None,
                "target".to_string(),
            )
            .await
            .unwrap();

        // The first event has been observed, so the command must be tracked:
        // kill either succeeds or reports the command as already done — never
        // a registration race.
        manager.kill_command("streamer", "target").await.unwrap();

        // Second kill: the handle is gone.
        let err = manager.kill_command("streamer", "target").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandNotFound);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn stream_events_reach_the_callback() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(test_config(dir.path()));

        let events: Arc<StdMutex<Vec<ExecEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let drain = manager
            .execute_stream_in_session(
                "cb",
                "echo streamed",
                move |event| sink.lock().unwrap().push(event),
                None,
                "cb-cmd".to_string(),
            )
            .await
            .unwrap();
        drain.await.unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(ExecEvent::Start { .. })));
        assert!(events.iter().any(
            |e| matches!(e, ExecEvent::Stdout { data } if data == "streamed\n")
        ));
        assert!(matches!(
            events.last(),
            Some(ExecEvent::Complete { exit_code: 0, .. })
        ));
        manager.destroy().await;
    }

    #[test]
    fn var_name_validation() {
        assert!(is_valid_var_name("PATH"));
        assert!(is_valid_var_name("_private"));
        assert!(is_valid_var_name("A1_b2"));
        assert!(!is_valid_var_name(""));
        assert!(!is_valid_var_name("1ST"));
        assert!(!is_valid_var_name("BAD NAME"));
        assert!(!is_valid_var_name("inject;rm"));
    }
}
