//! One persistent shell session.
//!
//! A [`Session`] owns a single long-running `bash --norc` child, a dedicated
//! temp directory, and the table of commands currently in flight. Commands
//! are injected as script blocks on the shell's stdin and their output comes
//! back through the labeled log file (see [`super::protocol`] and
//! [`super::script`]), so foreground commands run in the shell's own context
//! and their `cd` / `export` / function definitions persist for subsequent
//! calls.
//!
//! ## Liveness
//!
//! The child's stdin is fed by a writer task (mpsc-backed, so callers never
//! block on a stuck pipe) and an exit-watcher task flips the shared `alive`
//! flag when the shell dies. A session is ready iff the flag is up and
//! `destroy` has not run.
//!
//! ## Completion detection
//!
//! The exit-code file is the authoritative completion signal. `exec` awaits
//! it with a short poll loop under a deadline; a file that already exists
//! when the wait starts is picked up on the first iteration, so there is no
//! create/watch race.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{self, OutputStream};
use super::script::{self, CommandFiles};
use crate::error::{Error, ErrorCode};
use crate::util::now_ms;

/// Poll cadence while awaiting a foreground command's exit-code file.
const EXIT_POLL_MS: u64 = 50;

/// Poll cadence of the streaming log pump.
const STREAM_POLL_MS: u64 = 100;

/// Grace period between SIGTERM and SIGKILL on destroy.
const DESTROY_GRACE: Duration = Duration::from_secs(1);

/// Fully resolved settings for one session. The manager fills these from its
/// config plus per-request overrides before calling [`Session::initialize`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub id: String,
    /// Shell binary. `--norc` is appended for bash.
    pub shell: String,
    /// Session working directory, created if missing.
    pub cwd: String,
    /// Extra environment merged over the inherited environment. The UTF-8
    /// locale (`LANG`/`LC_ALL` = `C.UTF-8`) is forced on top.
    pub env: HashMap<String, String>,
    pub command_timeout: Duration,
    pub max_output_bytes: u64,
}

/// Per-call options for [`Session::exec`] / [`Session::exec_stream`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Run this one command in a different directory (saved and restored
    /// around foreground commands).
    pub cwd: Option<String>,
    /// Caller-chosen command id; a v4 uuid is minted when absent.
    pub command_id: Option<String>,
}

/// Result of a completed foreground command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub command: String,
    pub duration_ms: u64,
    /// Epoch milliseconds when the command was submitted.
    pub timestamp: u64,
}

/// Events yielded by [`Session::exec_stream`].
///
/// `Start` precedes any chunk; chunks preserve log order; `Complete` or
/// `Error` is last and delivered exactly once.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    Start {
        command_id: String,
        timestamp: u64,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Complete {
        exit_code: i32,
        result: ExecResult,
    },
    Error {
        error: Error,
    },
}

/// A persistent interactive shell with labeled-output command execution.
#[derive(Debug)]
pub struct Session {
    id: String,
    temp_dir: PathBuf,
    cwd: String,
    created_at: u64,
    command_timeout: Duration,
    max_output_bytes: u64,
    shell_pid: u32,
    /// `None` once destroy has closed the shell's stdin.
    stdin_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    alive: Arc<AtomicBool>,
    ready: AtomicBool,
    destroyed: AtomicBool,
    commands: Arc<Mutex<HashMap<String, CommandFiles>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Create the session temp directory and spawn the shell.
    pub async fn initialize(settings: SessionSettings) -> Result<Self, Error> {
        let created_at = now_ms();
        let temp_dir = std::env::temp_dir().join(format!("session-{}-{created_at}", settings.id));
        tokio::fs::create_dir_all(&temp_dir).await.map_err(|e| {
            Error::internal(format!(
                "Failed to create session directory {}: {e}",
                temp_dir.display()
            ))
        })?;
        if let Err(e) = tokio::fs::create_dir_all(&settings.cwd).await {
            warn!(
                "Session {}: could not create working dir {}: {e}",
                settings.id, settings.cwd
            );
        }

        let mut cmd = Command::new(&settings.shell);
        if settings.shell.ends_with("bash") {
            cmd.arg("--norc");
        }
        cmd.current_dir(&settings.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .envs(&settings.env)
            .env("LANG", "C.UTF-8")
            .env("LC_ALL", "C.UTF-8");
        // SAFETY: setpgid is async-signal-safe per POSIX. The shell becomes a
        // process group leader so destroy can signal the whole tree.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
        let mut child = cmd.spawn().map_err(|e| {
            let _ = std::fs::remove_dir_all(&temp_dir);
            Error::new(
                ErrorCode::ShellSpawnFailed,
                format!("Failed to spawn {}: {e}", settings.shell),
            )
        })?;
        let shell_pid = child.id().unwrap_or(0);
        let mut stdin = child.stdin.take().ok_or_else(|| {
            Error::new(ErrorCode::ShellSpawnFailed, "Failed to take stdin pipe")
        })?;

        let alive = Arc::new(AtomicBool::new(true));

        // stdin writer task — each message is one complete script block.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_task = tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            // Dropping stdin here sends EOF to the shell.
        });

        // Exit watcher task.
        let alive_watch = Arc::clone(&alive);
        let watch_id = settings.id.clone();
        let exit_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("Session {watch_id} shell exited ({status})"),
                Err(e) => warn!("Session {watch_id} shell wait error: {e}"),
            }
            alive_watch.store(false, Ordering::SeqCst);
        });

        info!(
            "Session {} initialized (pid {shell_pid}, dir {})",
            settings.id,
            temp_dir.display()
        );

        Ok(Self {
            id: settings.id,
            temp_dir,
            cwd: settings.cwd,
            created_at,
            command_timeout: settings.command_timeout,
            max_output_bytes: settings.max_output_bytes,
            shell_pid,
            stdin_tx: Mutex::new(Some(stdin_tx)),
            alive,
            ready: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            commands: Arc::new(Mutex::new(HashMap::new())),
            tasks: vec![stdin_task, exit_task],
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn shell_pid(&self) -> u32 {
        self.shell_pid
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Number of commands currently registered.
    pub async fn active_commands(&self) -> usize {
        self.commands.lock().await.len()
    }

    /// True iff the shell is alive and the session has not been destroyed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
            && self.alive.load(Ordering::SeqCst)
            && !self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        if self.destroyed.load(Ordering::SeqCst) || !self.ready.load(Ordering::SeqCst) {
            return Err(Error::new(
                ErrorCode::SessionNotReady,
                format!("Session {} is not ready", self.id),
            ));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::new(
                ErrorCode::SessionDead,
                format!("Session {} shell has exited", self.id),
            ));
        }
        Ok(())
    }

    /// Run a foreground command and wait for its result.
    ///
    /// State mutations (`cd`, `export`, functions) persist for later calls on
    /// this session. Fails with `COMMAND_TIMEOUT` after the configured
    /// per-command timeout, `OUTPUT_TOO_LARGE` when the log exceeds the cap,
    /// and `SESSION_DEAD` when the shell exits mid-command.
    pub async fn exec(&self, command: &str, opts: ExecOptions) -> Result<ExecResult, Error> {
        self.ensure_ready()?;
        let start = Instant::now();
        let timestamp = now_ms();
        let command_id = opts
            .command_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let files = self.register_command(&command_id).await?;

        let setup = async {
            self.prepare_fifos(&files).await?;
            let script = script::foreground(command, &files, opts.cwd.as_deref());
            self.send_stdin(script).await
        };
        if let Err(e) = setup.await {
            self.unregister_command(&command_id).await;
            files.cleanup().await;
            return Err(e);
        }

        let exit_code =
            match tokio::time::timeout(self.command_timeout, self.await_exit_code(&files)).await {
                Ok(Ok(code)) => code,
                Ok(Err(e)) => {
                    self.unregister_command(&command_id).await;
                    files.cleanup().await;
                    return Err(e);
                }
                Err(_) => {
                    self.unregister_command(&command_id).await;
                    // Best-effort kill; only background commands leave a pid
                    // file, a timed-out foreground command keeps running.
                    kill_via_pid_file(&files).await;
                    files.cleanup().await;
                    return Err(Error::new(
                        ErrorCode::CommandTimeout,
                        format!(
                            "Command timed out after {} ms",
                            self.command_timeout.as_millis()
                        ),
                    )
                    .with_details(json!({ "command": command })));
                }
            };

        let log_size = tokio::fs::metadata(&files.log)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if log_size > self.max_output_bytes {
            self.unregister_command(&command_id).await;
            files.cleanup().await;
            return Err(Error::new(
                ErrorCode::OutputTooLarge,
                format!(
                    "Command output ({log_size} bytes) exceeds the {} byte limit",
                    self.max_output_bytes
                ),
            ));
        }

        let bytes = tokio::fs::read(&files.log).await.unwrap_or_default();
        let parsed = protocol::parse_log(&bytes);
        self.unregister_command(&command_id).await;
        files.cleanup().await;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        Ok(ExecResult {
            stdout: parsed.stdout,
            stderr: parsed.stderr,
            exit_code,
            command: command.to_string(),
            duration_ms,
            timestamp,
        })
    }

    /// Start a background command and stream its events.
    ///
    /// The command is registered (and therefore killable) before this method
    /// returns. The returned channel yields `Start`, then output chunks in
    /// log order at a 100 ms poll cadence, then exactly one `Complete` or
    /// `Error`. A command killed before it could write an exit status
    /// completes with exit code −1.
    pub async fn exec_stream(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<mpsc::Receiver<ExecEvent>, Error> {
        self.ensure_ready()?;
        let command_id = opts
            .command_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let files = self.register_command(&command_id).await?;

        let setup = async {
            self.prepare_fifos(&files).await?;
            let script = script::background(command, &files, opts.cwd.as_deref());
            self.send_stdin(script).await
        };
        if let Err(e) = setup.await {
            self.unregister_command(&command_id).await;
            files.cleanup().await;
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(256);
        let pump = StreamPump {
            command: command.to_string(),
            command_id,
            files,
            alive: Arc::clone(&self.alive),
            commands: Arc::clone(&self.commands),
            max_output_bytes: self.max_output_bytes,
            tx,
        };
        tokio::spawn(pump.run());
        Ok(rx)
    }

    /// Best-effort SIGTERM of a background command via its pid file.
    ///
    /// Returns `false` when the command is not in the table or its pid file
    /// is already gone (the command has terminated). Foreground commands
    /// never have a pid file.
    pub async fn kill_command(&self, command_id: &str) -> bool {
        let files = { self.commands.lock().await.get(command_id).cloned() };
        let Some(files) = files else {
            return false;
        };
        let Ok(text) = tokio::fs::read_to_string(&files.pid).await else {
            return false;
        };
        let Ok(pid) = text.trim().parse::<i32>() else {
            return false;
        };
        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => debug!("Session {}: SIGTERM sent to command {command_id} (pid {pid})", self.id),
            // ESRCH means the subshell beat us to the exit; the pid file was
            // still present so the caller still gets `true`.
            Err(e) => debug!("Session {}: kill {pid} for {command_id}: {e}", self.id),
        }
        self.commands.lock().await.remove(command_id);
        true
    }

    /// Best-effort ordered shutdown: close stdin, SIGTERM the process group,
    /// wait up to 1 s, SIGKILL, remove the session directory. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);

        // Close stdin first — a quiescent shell exits on EOF by itself.
        self.stdin_tx.lock().await.take();

        #[allow(clippy::cast_possible_wrap)]
        let pgid = Pid::from_raw(-(self.shell_pid as i32));
        if self.alive.load(Ordering::SeqCst) && self.shell_pid > 0 {
            let _ = signal::kill(pgid, Signal::SIGTERM);
            let deadline = Instant::now() + DESTROY_GRACE;
            while self.alive.load(Ordering::SeqCst) && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if self.alive.load(Ordering::SeqCst) {
                let _ = signal::kill(pgid, Signal::SIGKILL);
            }
        }

        for task in &self.tasks {
            task.abort();
        }
        self.commands.lock().await.clear();

        if let Err(e) = tokio::fs::remove_dir_all(&self.temp_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Session {}: failed to remove {}: {e}",
                    self.id,
                    self.temp_dir.display()
                );
            }
        }
        info!("Session {} destroyed", self.id);
    }

    async fn register_command(&self, command_id: &str) -> Result<CommandFiles, Error> {
        let mut commands = self.commands.lock().await;
        if commands.contains_key(command_id) {
            return Err(Error::internal(format!(
                "Command id {command_id} is already registered in session {}",
                self.id
            )));
        }
        let files = CommandFiles::new(&self.temp_dir, command_id);
        commands.insert(command_id.to_string(), files.clone());
        Ok(files)
    }

    async fn unregister_command(&self, command_id: &str) {
        self.commands.lock().await.remove(command_id);
    }

    /// Remove stale pipes and create fresh ones. Done from here rather than
    /// inside the script so creation failures surface as typed errors.
    async fn prepare_fifos(&self, files: &CommandFiles) -> Result<(), Error> {
        for path in [&files.stdout_pipe, &files.stderr_pipe] {
            let _ = tokio::fs::remove_file(path).await;
            nix::unistd::mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
                Error::new(
                    ErrorCode::FifoInitFailed,
                    format!("mkfifo {} failed: {e}", path.display()),
                )
            })?;
        }
        Ok(())
    }

    async fn send_stdin(&self, script: String) -> Result<(), Error> {
        let tx = self.stdin_tx.lock().await.as_ref().cloned();
        let Some(tx) = tx else {
            return Err(Error::new(
                ErrorCode::SessionDead,
                format!("Session {} stdin is closed", self.id),
            ));
        };
        tx.send(script.into_bytes()).await.map_err(|_| {
            Error::new(
                ErrorCode::SessionDead,
                format!("Session {} stdin is closed", self.id),
            )
        })
    }

    async fn await_exit_code(&self, files: &CommandFiles) -> Result<i32, Error> {
        loop {
            if let Some(code) = read_exit_code(&files.exit_code).await {
                return Ok(code);
            }
            if !self.alive.load(Ordering::SeqCst) {
                // The shell died; the exit trap may still have landed first.
                if let Some(code) = read_exit_code(&files.exit_code).await {
                    return Ok(code);
                }
                return Err(Error::new(
                    ErrorCode::SessionDead,
                    format!("Session {} shell exited mid-command", self.id),
                ));
            }
            tokio::time::sleep(Duration::from_millis(EXIT_POLL_MS)).await;
        }
    }
}

/// Read and parse an exit-code file; `None` while absent or still empty.
async fn read_exit_code(path: &Path) -> Option<i32> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    text.split_whitespace().next()?.parse().ok()
}

/// SIGTERM whatever pid the command's pid file names, if any.
async fn kill_via_pid_file(files: &CommandFiles) {
    if let Ok(text) = tokio::fs::read_to_string(&files.pid).await {
        if let Ok(pid) = text.trim().parse::<i32>() {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }
}

/// Background task that turns a command's log file into an event stream.
struct StreamPump {
    command: String,
    command_id: String,
    files: CommandFiles,
    alive: Arc<AtomicBool>,
    commands: Arc<Mutex<HashMap<String, CommandFiles>>>,
    max_output_bytes: u64,
    tx: mpsc::Sender<ExecEvent>,
}

impl StreamPump {
    async fn run(self) {
        let timestamp = now_ms();
        let start = Instant::now();

        // Hold `Start` back until the shell has processed the script and
        // written the pid file: once the caller sees the first event, the
        // command must be killable. A very fast command may already have its
        // exit status instead.
        let mut saw_pid = false;
        loop {
            if tokio::fs::metadata(&self.files.pid).await.is_ok() {
                saw_pid = true;
                break;
            }
            if read_exit_code(&self.files.exit_code).await.is_some() {
                break;
            }
            if !self.alive.load(Ordering::SeqCst) {
                let _ = self
                    .tx
                    .send(ExecEvent::Error {
                        error: Error::new(
                            ErrorCode::SessionDead,
                            "Session shell exited before the command started",
                        ),
                    })
                    .await;
                self.finish().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = self
            .tx
            .send(ExecEvent::Start {
                command_id: self.command_id.clone(),
                timestamp,
            })
            .await;

        let mut cursor = 0usize;
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut interval = tokio::time::interval(Duration::from_millis(STREAM_POLL_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let bytes = tokio::fs::read(&self.files.log).await.unwrap_or_default();
            if bytes.len() as u64 > self.max_output_bytes {
                let _ = self
                    .tx
                    .send(ExecEvent::Error {
                        error: Error::new(
                            ErrorCode::OutputTooLarge,
                            format!(
                                "Command output exceeds the {} byte limit",
                                self.max_output_bytes
                            ),
                        ),
                    })
                    .await;
                self.finish().await;
                return;
            }
            cursor = self.emit_from(&bytes, cursor, &mut stdout, &mut stderr).await;

            // The exit-code file is written strictly after the last log line,
            // so drain once more after seeing it.
            if let Some(code) = read_exit_code(&self.files.exit_code).await {
                let bytes = tokio::fs::read(&self.files.log).await.unwrap_or_default();
                self.emit_from(&bytes, cursor, &mut stdout, &mut stderr).await;
                self.complete(code, timestamp, &start, stdout, stderr).await;
                return;
            }

            match tokio::fs::metadata(&self.files.pid).await {
                Ok(_) => saw_pid = true,
                Err(_) if saw_pid => {
                    // Pid file removed without an exit status: the command was
                    // killed before it could report one.
                    let bytes = tokio::fs::read(&self.files.log).await.unwrap_or_default();
                    self.emit_from(&bytes, cursor, &mut stdout, &mut stderr).await;
                    let code = read_exit_code(&self.files.exit_code).await.unwrap_or(-1);
                    self.complete(code, timestamp, &start, stdout, stderr).await;
                    return;
                }
                Err(_) => {}
            }

            if !self.alive.load(Ordering::SeqCst) {
                let _ = self
                    .tx
                    .send(ExecEvent::Error {
                        error: Error::new(
                            ErrorCode::SessionDead,
                            "Session shell exited while the command was streaming",
                        ),
                    })
                    .await;
                self.finish().await;
                return;
            }
        }
    }

    async fn emit_from(
        &self,
        bytes: &[u8],
        cursor: usize,
        stdout: &mut String,
        stderr: &mut String,
    ) -> usize {
        let (chunks, next) = protocol::drain_lines(bytes, cursor);
        for (stream, data) in chunks {
            match stream {
                OutputStream::Stdout => {
                    stdout.push_str(&data);
                    let _ = self.tx.send(ExecEvent::Stdout { data }).await;
                }
                OutputStream::Stderr => {
                    stderr.push_str(&data);
                    let _ = self.tx.send(ExecEvent::Stderr { data }).await;
                }
            }
        }
        next
    }

    async fn complete(
        self,
        exit_code: i32,
        timestamp: u64,
        start: &Instant,
        stdout: String,
        stderr: String,
    ) {
        #[allow(clippy::cast_possible_truncation)]
        let result = ExecResult {
            stdout,
            stderr,
            exit_code,
            command: self.command.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp,
        };
        let _ = self
            .tx
            .send(ExecEvent::Complete { exit_code, result })
            .await;
        self.finish().await;
    }

    async fn finish(&self) {
        self.commands.lock().await.remove(&self.command_id);
        self.files.cleanup().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_session(id: &str, cwd: &Path) -> Session {
        Session::initialize(SessionSettings {
            id: id.to_string(),
            shell: "/bin/bash".to_string(),
            cwd: cwd.to_string_lossy().into_owned(),
            env: HashMap::new(),
            command_timeout: Duration::from_secs(10),
            max_output_bytes: 10 * 1024 * 1024,
        })
        .await
        .expect("session should initialize")
    }

    async fn collect_stream(mut rx: mpsc::Receiver<ExecEvent>) -> Vec<ExecEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(10), rx.recv()).await
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn cwd_persists_across_exec_calls() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("cwd", dir.path()).await;

        let result = session
            .exec("mkdir -p sub && cd sub", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);

        let result = session.exec("pwd", ExecOptions::default()).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(
            result.stdout.trim_end().ends_with("/sub"),
            "pwd was {:?}",
            result.stdout
        );
        session.destroy().await;
    }

    #[tokio::test]
    async fn exported_variables_persist() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("env", dir.path()).await;

        session
            .exec("export X=42", ExecOptions::default())
            .await
            .unwrap();
        let result = session
            .exec("echo $X", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stdout, "42\n");
        assert_eq!(result.exit_code, 0);
        session.destroy().await;
    }

    #[tokio::test]
    async fn shell_functions_persist() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("fns", dir.path()).await;

        session
            .exec("greet() { echo \"hi $1\"; }", ExecOptions::default())
            .await
            .unwrap();
        let result = session
            .exec("greet world", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stdout, "hi world\n");
        session.destroy().await;
    }

    #[tokio::test]
    async fn stdout_stderr_and_exit_code_are_demultiplexed() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("demux", dir.path()).await;

        let result = session
            .exec("echo out; echo err 1>&2; exit 3", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, 3);
        session.destroy().await;
    }

    #[tokio::test]
    async fn per_command_cwd_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("elsewhere");
        std::fs::create_dir(&sub).unwrap();
        let session = new_session("ccwd", dir.path()).await;

        let result = session
            .exec(
                "pwd",
                ExecOptions {
                    cwd: Some(sub.to_string_lossy().into_owned()),
                    command_id: None,
                },
            )
            .await
            .unwrap();
        assert!(result.stdout.trim_end().ends_with("/elsewhere"));

        let result = session.exec("pwd", ExecOptions::default()).await.unwrap();
        assert!(!result.stdout.trim_end().ends_with("/elsewhere"));
        session.destroy().await;
    }

    #[tokio::test]
    async fn missing_per_command_cwd_fails_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("badcwd", dir.path()).await;

        let marker = dir.path().join("ran");
        let result = session
            .exec(
                &format!("touch {}", marker.display()),
                ExecOptions {
                    cwd: Some("/definitely/not/here".to_string()),
                    command_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("No such file or directory"));
        assert!(!marker.exists());
        session.destroy().await;
    }

    #[tokio::test]
    async fn exec_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SessionSettings {
            id: "timeout".to_string(),
            shell: "/bin/bash".to_string(),
            cwd: dir.path().to_string_lossy().into_owned(),
            env: HashMap::new(),
            command_timeout: Duration::from_millis(500),
            max_output_bytes: 10 * 1024 * 1024,
        };
        let session = Session::initialize(settings).await.unwrap();

        let started = Instant::now();
        let err = session
            .exec("sleep 5", ExecOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandTimeout);
        assert!(started.elapsed() < Duration::from_secs(2));
        session.destroy().await;
    }

    #[tokio::test]
    async fn output_over_the_cap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SessionSettings {
            id: "cap".to_string(),
            shell: "/bin/bash".to_string(),
            cwd: dir.path().to_string_lossy().into_owned(),
            env: HashMap::new(),
            command_timeout: Duration::from_secs(10),
            max_output_bytes: 1024,
        };
        let session = Session::initialize(settings).await.unwrap();

        let err = session
            .exec("head -c 4096 /dev/zero | tr '\\0' 'x'", ExecOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::OutputTooLarge);
        session.destroy().await;
    }

    #[tokio::test]
    async fn stream_orders_start_chunks_complete() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("stream", dir.path()).await;

        let rx = session
            .exec_stream("echo a; echo b 1>&2; echo c", ExecOptions::default())
            .await
            .unwrap();
        let events = collect_stream(rx).await;

        assert!(matches!(events.first(), Some(ExecEvent::Start { .. })));
        assert!(matches!(
            events.last(),
            Some(ExecEvent::Complete { exit_code: 0, .. })
        ));
        let stdout: String = events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Stdout { data } => Some(data.as_str()),
                _ => None,
            })
            .collect();
        let stderr: String = events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Stderr { data } => Some(data.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, "a\nc\n");
        assert_eq!(stderr, "b\n");
        // Exactly one terminal event.
        let terminals = events
            .iter()
            .filter(|e| matches!(e, ExecEvent::Complete { .. } | ExecEvent::Error { .. }))
            .count();
        assert_eq!(terminals, 1);
        session.destroy().await;
    }

    #[tokio::test]
    async fn killed_stream_command_completes_with_negative_code() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("kill", dir.path()).await;

        let rx = session
            .exec_stream(
                "exec sleep 30",
                ExecOptions {
                    cwd: None,
                    command_id: Some("victim".to_string()),
                },
            )
            .await
            .unwrap();

        // Wait for the shell to write the pid file, then kill.
        let mut killed = false;
        for _ in 0..50 {
            if session.kill_command("victim").await {
                killed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(killed, "kill_command never found a pid file");
        // Idempotent: the handle is gone now.
        assert!(!session.kill_command("victim").await);

        let events = collect_stream(rx).await;
        assert!(matches!(
            events.last(),
            Some(ExecEvent::Complete { exit_code: -1, .. })
        ));
        session.destroy().await;
    }

    #[tokio::test]
    async fn kill_unknown_command_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("nokill", dir.path()).await;
        assert!(!session.kill_command("ghost").await);
        session.destroy().await;
    }

    #[tokio::test]
    async fn destroy_removes_directory_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("destroy", dir.path()).await;
        let temp = session.temp_dir().to_path_buf();
        assert!(temp.exists());

        session.destroy().await;
        assert!(!temp.exists());
        session.destroy().await;

        let err = session
            .exec("true", ExecOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotReady);
    }

    #[tokio::test]
    async fn exec_reports_dead_shell() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session("dead", dir.path()).await;

        // `exit 0` terminates the shell; the status is still captured.
        let result = session.exec("exit 0", ExecOptions::default()).await.unwrap();
        assert_eq!(result.exit_code, 0);

        // The watcher needs a beat to reap the child.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = session
            .exec("true", ExecOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionDead);
        session.destroy().await;
    }
}
