//! Sandbox-wide background process management.
//!
//! [`ProcessService`] turns "start a background process" into a streaming
//! command on a session: it mints a process id (reused as the session
//! command id), inserts a [`ProcessRecord`], and wires the session's event
//! stream into the record — buffering output, fanning it out to listeners,
//! and interpreting the exit code into a terminal status. Records outlive
//! their commands so logs stay retrievable until the periodic GC sweeps
//! terminal records past the configured age.
//!
//! The record ↔ session-command relationship is a weak `{session_id,
//! command_id}` pair; killing goes back through the [`SessionManager`]
//! lookup, never through a stored handle.
//!
//! The store sits behind a std `Mutex` (never held across an await) because
//! the stream callback that feeds it is synchronous.

pub mod store;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorCode};
use crate::sessions::protocol::OutputStream;
use crate::sessions::{ExecEvent, SessionManager};

pub use store::{CommandRef, LogChunk, ProcessInfo, ProcessRecord, ProcessStatus, ProcessStore};

/// Session used by executions that don't name one.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Options for [`ProcessService::execute_command`] and the streaming starters.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Target session; the shared `default` session when absent.
    pub session_id: Option<String>,
    /// Per-command working directory override.
    pub cwd: Option<String>,
    /// Timeout applied when the target session is created by this call.
    pub timeout_ms: Option<u64>,
}

/// Outcome of a blocking execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Façade over [`SessionManager`] + [`ProcessStore`].
///
/// Cloneable — clones share the same store.
#[derive(Clone)]
pub struct ProcessService {
    sessions: SessionManager,
    store: Arc<Mutex<ProcessStore>>,
}

impl ProcessService {
    #[must_use]
    pub fn new(sessions: SessionManager) -> Self {
        Self {
            sessions,
            store: Arc::new(Mutex::new(ProcessStore::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProcessStore> {
        // A poisoned lock only means a panic mid-update; the store itself is
        // still structurally sound.
        self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Boundary validation: commands must be non-empty and free of null bytes.
    fn validate_command(command: &str) -> Result<(), Error> {
        if command.trim().is_empty() {
            return Err(Error::new(
                ErrorCode::InvalidCommand,
                "Command must not be empty",
            ));
        }
        if command.contains('\0') {
            return Err(Error::new(
                ErrorCode::InvalidCommand,
                "Command must not contain null bytes",
            ));
        }
        Ok(())
    }

    /// Run a command to completion in its session and report the outcome.
    pub async fn execute_command(
        &self,
        command: &str,
        opts: ExecuteOptions,
    ) -> Result<CommandOutcome, Error> {
        Self::validate_command(command)?;
        let session_id = opts.session_id.as_deref().unwrap_or(DEFAULT_SESSION_ID);
        let result = self
            .sessions
            .execute_in_session(session_id, command, opts.cwd.as_deref(), opts.timeout_ms)
            .await?;
        Ok(CommandOutcome {
            success: result.exit_code == 0,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    /// Start a long-lived background process. Semantically identical to
    /// [`Self::execute_command_stream`]; both return once the process record
    /// is live and killable.
    pub async fn start_process(
        &self,
        command: &str,
        opts: ExecuteOptions,
    ) -> Result<ProcessInfo, Error> {
        self.execute_command_stream(command, opts).await
    }

    /// Start a streaming command and return its record snapshot immediately
    /// after the first stream event has been observed.
    pub async fn execute_command_stream(
        &self,
        command: &str,
        opts: ExecuteOptions,
    ) -> Result<ProcessInfo, Error> {
        self.start_stream(command, opts, None).await
    }

    /// Like [`Self::execute_command_stream`], but also tees the raw execution
    /// events to the returned channel (used by the SSE endpoint). The channel
    /// closes after the terminal event.
    pub async fn execute_command_stream_events(
        &self,
        command: &str,
        opts: ExecuteOptions,
    ) -> Result<(ProcessInfo, tokio::sync::mpsc::UnboundedReceiver<ExecEvent>), Error> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let info = self.start_stream(command, opts, Some(tx)).await?;
        Ok((info, rx))
    }

    async fn start_stream(
        &self,
        command: &str,
        opts: ExecuteOptions,
        forward: Option<tokio::sync::mpsc::UnboundedSender<ExecEvent>>,
    ) -> Result<ProcessInfo, Error> {
        Self::validate_command(command)?;
        let id = Uuid::new_v4().to_string();
        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());

        // The record exists before the first stream event so listeners can
        // attach from the moment the caller has the id.
        self.lock().insert(ProcessRecord::new(
            id.clone(),
            command.to_string(),
            session_id.clone(),
            CommandRef {
                session_id: session_id.clone(),
                command_id: id.clone(),
            },
        ));

        let store = Arc::clone(&self.store);
        let record_id = id.clone();
        let on_event = move |event: ExecEvent| {
            if let Some(ref tx) = forward {
                let _ = tx.send(event.clone());
            }
            let mut store = store
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            store.update(&record_id, |record| match event {
                ExecEvent::Start { .. } => {
                    record.transition(ProcessStatus::Running);
                }
                ExecEvent::Stdout { data } => record.push_output(LogChunk {
                    stream: OutputStream::Stdout,
                    data,
                }),
                ExecEvent::Stderr { data } => record.push_output(LogChunk {
                    stream: OutputStream::Stderr,
                    data,
                }),
                ExecEvent::Complete { exit_code, .. } => {
                    record.exit_code = Some(exit_code);
                    let status = if exit_code == 0 {
                        ProcessStatus::Completed
                    } else {
                        ProcessStatus::Failed
                    };
                    record.transition(status);
                }
                ExecEvent::Error { error } => {
                    warn!("Process {}: stream error: {error}", record.id);
                    record.transition(ProcessStatus::Error);
                }
            });
        };

        let started = self
            .sessions
            .execute_stream_in_session(&session_id, command, on_event, opts.cwd.as_deref(), id.clone())
            .await;
        if let Err(e) = started {
            // Initial failure: the stream never produced an event. Surface it
            // synchronously and leave an `error` record behind.
            self.lock().update(&id, |record| {
                record.transition(ProcessStatus::Error);
            });
            return Err(e);
        }

        if let Ok(session) = self.sessions.get_session(&session_id).await {
            let shell_pid = session.shell_pid();
            self.lock().update(&id, |record| record.pid = Some(shell_pid));
        }

        debug!("Process {id} started in session {session_id}");
        self.get_process(&id)
    }

    /// Snapshot of one record.
    pub fn get_process(&self, id: &str) -> Result<ProcessInfo, Error> {
        self.lock()
            .get(id)
            .map(ProcessRecord::info)
            .ok_or_else(|| {
                Error::new(ErrorCode::ProcessNotFound, format!("Process {id} not found"))
            })
    }

    /// All records, optionally filtered by status.
    #[must_use]
    pub fn list_processes(&self, status: Option<ProcessStatus>) -> Vec<ProcessInfo> {
        self.lock().list(status)
    }

    /// Buffered stdout/stderr of one record.
    pub fn process_logs(&self, id: &str) -> Result<(String, String), Error> {
        self.lock()
            .get(id)
            .map(|r| (r.stdout.clone(), r.stderr.clone()))
            .ok_or_else(|| {
                Error::new(ErrorCode::ProcessNotFound, format!("Process {id} not found"))
            })
    }

    /// Kill a background process.
    ///
    /// Unknown ids fail with `PROCESS_NOT_FOUND`. A record that is already
    /// terminal (or no longer holds a command handle) is a success no-op.
    /// Otherwise the session command is SIGTERMed and the record moves to
    /// `killed` — its one and only terminal transition.
    pub async fn kill_process(&self, id: &str) -> Result<(), Error> {
        let command_ref = {
            let store = self.lock();
            let record = store.get(id).ok_or_else(|| {
                Error::new(ErrorCode::ProcessNotFound, format!("Process {id} not found"))
            })?;
            if record.status.is_terminal() {
                return Ok(());
            }
            record.command_ref.clone()
        };
        let Some(command_ref) = command_ref else {
            return Ok(());
        };

        match self
            .sessions
            .kill_command(&command_ref.session_id, &command_ref.command_id)
            .await
        {
            Ok(()) => {}
            // The command finished (or its session vanished) between our
            // check and the kill — the record settles on its own.
            Err(e)
                if e.code == ErrorCode::CommandNotFound
                    || e.code == ErrorCode::SessionNotFound =>
            {
                debug!("Process {id}: nothing left to kill ({e})");
            }
            Err(e) => return Err(e),
        }

        self.lock().update(id, |record| {
            if record.transition(ProcessStatus::Killed) {
                info!("Process {id} killed");
            }
        });
        Ok(())
    }

    /// Kill every non-terminal process. Returns how many were killed.
    pub async fn kill_all_processes(&self) -> usize {
        let ids: Vec<String> = self
            .lock()
            .list(None)
            .into_iter()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.id)
            .collect();
        let mut killed = 0;
        for id in ids {
            match self.kill_process(&id).await {
                Ok(()) => killed += 1,
                Err(e) => warn!("kill-all: process {id}: {e}"),
            }
        }
        killed
    }

    /// Restartable log stream for one process.
    ///
    /// The returned channel immediately carries the already-buffered stdout
    /// and stderr, then live chunks as they arrive, and closes on the first
    /// terminal status. A stream opened on an already-terminal record yields
    /// the buffers and closes at once.
    pub fn stream_process_logs(
        &self,
        id: &str,
    ) -> Result<tokio::sync::mpsc::UnboundedReceiver<LogChunk>, Error> {
        let mut store = self.lock();
        let record = store.get_mut(id).ok_or_else(|| {
            Error::new(ErrorCode::ProcessNotFound, format!("Process {id} not found"))
        })?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        if !record.stdout.is_empty() {
            let _ = tx.send(LogChunk {
                stream: OutputStream::Stdout,
                data: record.stdout.clone(),
            });
        }
        if !record.stderr.is_empty() {
            let _ = tx.send(LogChunk {
                stream: OutputStream::Stderr,
                data: record.stderr.clone(),
            });
        }
        if !record.status.is_terminal() {
            record.add_output_listener(tx);
        }
        // Terminal: tx drops here and the receiver closes after the buffers.
        Ok(rx)
    }

    /// Remove terminal records older than `max_age`. Returns how many were
    /// deleted.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let removed = self.lock().cleanup(Instant::now() - max_age);
        if removed > 0 {
            info!("Process GC removed {removed} terminal record(s)");
        }
        removed
    }

    /// Kill everything and drop all records. Used during shutdown.
    pub async fn destroy(&self) {
        let killed = self.kill_all_processes().await;
        if killed > 0 {
            info!("Shutdown killed {killed} process(es)");
        }
        self.lock().cleanup(Instant::now());
    }
}
